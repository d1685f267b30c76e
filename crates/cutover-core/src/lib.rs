pub mod artifact;
pub mod config;
pub mod types;

pub use artifact::{ArtifactRef, LocalKind, SourceError};
pub use config::{
    ConfigError, CutoverConfig, Environment, GateSettings, Liveness, Steps, SupervisorSettings,
};
pub use types::*;
