//! cutover-deploy: preparation pipeline, promotion and automatic rollback.
//!
//! # Components
//!
//! - **`sequencer`**: ordered, fail-fast preparation steps (fetch, install,
//!   migrate, warm) in an isolated release workspace
//! - **`orchestrator`**: deploy / rollback / status / prune for one environment
//! - **`lock`**: one pipeline per environment
//! - **`error`**: failure taxonomy and CLI exit codes
//! - **`report`**: text and JSON rendering of results

pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod report;
pub mod sequencer;

pub use error::{DeployError, EXIT_INDETERMINATE, EXIT_OK, EXIT_PREPARATION, EXIT_ROLLED_BACK};
pub use lock::EnvironmentLock;
pub use orchestrator::{DeployReport, Orchestrator, RollbackReport, StatusReport};
pub use report::{PruneSummary, to_json};
pub use sequencer::{DeploymentSequencer, Pipeline, PipelinePhase};
