//! Deployment error taxonomy and its mapping to process exit codes.

use cutover_core::{ReleaseId, Step};
use cutover_state::StateError;
use thiserror::Error;

/// Exit code: release active and healthy.
pub const EXIT_OK: i32 = 0;
/// Exit code: preparation failed or request rejected; the old release still serves.
pub const EXIT_PREPARATION: i32 = 1;
/// Exit code: promoted release failed its health check and was rolled back.
pub const EXIT_ROLLED_BACK: i32 = 2;
/// Exit code: transport or infrastructure failure; state must be inspected.
pub const EXIT_INDETERMINATE: i32 = 3;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("release {release}: fetch failed: {reason}")]
    Transfer { release: ReleaseId, reason: String },

    #[error("release {release}: dependency install failed: {reason}")]
    Dependency { release: ReleaseId, reason: String },

    #[error(
        "release {release}: migration failed, the data store is in an unknown state and needs operator intervention: {reason}"
    )]
    Migration { release: ReleaseId, reason: String },

    #[error("release {release}: {step} failed: {reason}")]
    Preparation {
        release: ReleaseId,
        step: Step,
        reason: String,
    },

    #[error("invalid artifact reference: {0}")]
    InvalidArtifact(String),

    #[error("release {release}: slot already exists")]
    Conflict { release: ReleaseId },

    #[error("release {release} not found")]
    NotFound { release: ReleaseId },

    #[error("cannot roll back{}: {reason}", target(.release))]
    InvalidTarget {
        release: Option<ReleaseId>,
        reason: String,
    },

    #[error("environment {environment}: deployment already in progress ({holder})")]
    DeploymentInProgress { environment: String, holder: String },

    #[error("transport failure{}: {reason}", location(.release, .step))]
    Transport {
        release: Option<ReleaseId>,
        step: Option<Step>,
        reason: String,
    },

    #[error(
        "release {release}: {step} failed after promotion: {reason}; {}",
        restored(.rolled_back_to)
    )]
    DeploymentFailed {
        release: ReleaseId,
        step: Step,
        reason: String,
        rolled_back_to: Option<ReleaseId>,
    },

    #[error("release {release}: cancelled before promotion")]
    Cancelled { release: ReleaseId },

    #[error("release store: {0}")]
    State(StateError),
}

fn target(release: &Option<ReleaseId>) -> String {
    release.map(|id| format!(" to release {id}")).unwrap_or_default()
}

fn location(release: &Option<ReleaseId>, step: &Option<Step>) -> String {
    match (release, step) {
        (Some(r), Some(s)) => format!(" (release {r}, {s})"),
        (Some(r), None) => format!(" (release {r})"),
        (None, Some(s)) => format!(" ({s})"),
        (None, None) => String::new(),
    }
}

fn restored(release: &Option<ReleaseId>) -> String {
    match release {
        Some(id) => format!("rolled back, release {id} is active"),
        None => "no earlier release to restore, nothing is active".to_string(),
    }
}

impl DeployError {
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::DeploymentFailed { .. } => EXIT_ROLLED_BACK,
            DeployError::Transport { .. } | DeployError::State(_) => EXIT_INDETERMINATE,
            _ => EXIT_PREPARATION,
        }
    }

    /// Release the error is about, when there is one.
    pub fn release(&self) -> Option<ReleaseId> {
        match self {
            DeployError::Transfer { release, .. }
            | DeployError::Dependency { release, .. }
            | DeployError::Migration { release, .. }
            | DeployError::Preparation { release, .. }
            | DeployError::Conflict { release }
            | DeployError::NotFound { release }
            | DeployError::DeploymentFailed { release, .. }
            | DeployError::Cancelled { release } => Some(*release),
            DeployError::InvalidTarget { release, .. } | DeployError::Transport { release, .. } => {
                *release
            }
            DeployError::InvalidArtifact(_)
            | DeployError::DeploymentInProgress { .. }
            | DeployError::State(_) => None,
        }
    }

    /// Step that failed, when the error came from one.
    pub fn step(&self) -> Option<Step> {
        match self {
            DeployError::Transfer { .. } => Some(Step::Fetch),
            DeployError::Dependency { .. } => Some(Step::InstallDependencies),
            DeployError::Migration { .. } => Some(Step::Migrate),
            DeployError::Preparation { step, .. } | DeployError::DeploymentFailed { step, .. } => {
                Some(*step)
            }
            DeployError::Transport { step, .. } => *step,
            DeployError::Cancelled { .. } => Some(Step::Cancelled),
            _ => None,
        }
    }

    /// Error for a failed preparation step.
    pub fn step_failed(step: Step, release: ReleaseId, reason: String) -> Self {
        match step {
            Step::Fetch => DeployError::Transfer { release, reason },
            Step::InstallDependencies => DeployError::Dependency { release, reason },
            Step::Migrate => DeployError::Migration { release, reason },
            step => DeployError::Preparation {
                release,
                step,
                reason,
            },
        }
    }
}

impl From<StateError> for DeployError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(release) => DeployError::NotFound { release },
            StateError::Conflict(release) => DeployError::Conflict { release },
            StateError::InvalidTransition { release, from, .. } => DeployError::InvalidTarget {
                release: Some(release),
                reason: format!("release is {from}"),
            },
            StateError::NoRollbackTarget => DeployError::InvalidTarget {
                release: None,
                reason: err.to_string(),
            },
            StateError::NotPreChecked(release) => DeployError::Preparation {
                release,
                step: Step::PreCheck,
                reason: err.to_string(),
            },
            other => DeployError::State(other),
        }
    }
}
