//! Error types for the release store.

use cutover_core::{ReleaseId, ReleaseStatus};
use thiserror::Error;

/// Result type alias for release store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during release store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    /// Another process holds the database open.
    #[error("database {0} is open in another process")]
    Busy(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("filesystem error: {0}")]
    Io(String),

    #[error("failed to swap current link: {0}")]
    Link(String),

    #[error("release {0} not found")]
    NotFound(ReleaseId),

    #[error("release {0} already exists")]
    Conflict(ReleaseId),

    #[error("release {release} cannot move from {from} to {to}")]
    InvalidTransition {
        release: ReleaseId,
        from: ReleaseStatus,
        to: ReleaseStatus,
    },

    #[error("release {0} has not passed the pre-promotion health check")]
    NotPreChecked(ReleaseId),

    #[error("no retired release older than the current one")]
    NoRollbackTarget,

    #[error("expected release {expected} to be current, found {actual:?}")]
    UnexpectedCurrent {
        expected: ReleaseId,
        actual: Option<ReleaseId>,
    },
}
