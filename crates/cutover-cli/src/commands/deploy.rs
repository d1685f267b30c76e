//! `cutover deploy` and `cutover rollback`: the commands that move `current`.

use std::path::Path;

use cutover_core::ReleaseId;
use cutover_exec::cancel_pair;
use tracing::warn;

pub async fn deploy(config: &Path, env: Option<&str>, artifact: &str) -> anyhow::Result<()> {
    let orchestrator = super::open(config, env)?;

    // Ctrl-C aborts before promotion and rolls back after it.
    let (canceller, mut cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling deployment");
            let _ = canceller.send(true);
        }
    });

    let report = orchestrator.deploy(artifact, &mut cancel).await?;
    print!("{report}");
    Ok(())
}

pub async fn rollback(
    config: &Path,
    env: Option<&str>,
    release: Option<ReleaseId>,
) -> anyhow::Result<()> {
    let orchestrator = super::open(config, env)?;
    let report = orchestrator.rollback(release).await?;
    print!("{report}");
    Ok(())
}
