//! Cancellation signal shared between the CLI and a running deployment.

use tokio::sync::watch;

/// Receiving side; `true` means cancellation was requested.
pub type CancelSignal = watch::Receiver<bool>;

/// Sending side, held by whoever may cancel.
pub type Canceller = watch::Sender<bool>;

pub fn cancel_pair() -> (Canceller, CancelSignal) {
    watch::channel(false)
}

pub fn is_cancelled(signal: &CancelSignal) -> bool {
    *signal.borrow()
}

/// Resolve once cancellation is requested. Never resolves if the sender is gone.
pub async fn cancelled(signal: &mut CancelSignal) {
    if signal.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}
