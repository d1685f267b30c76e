//! Shared types used across cutover crates.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Monotonic release identifier allocated by the release store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReleaseId(pub u64);

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReleaseId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(ReleaseId)
    }
}

/// Lifecycle status of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Pending,
    Prepared,
    Active,
    Retired,
    Failed,
}

impl ReleaseStatus {
    /// Whether a release may move from `self` to `next`.
    pub fn can_transition_to(self, next: ReleaseStatus) -> bool {
        use ReleaseStatus::*;
        matches!(
            (self, next),
            (Pending, Prepared)
                | (Pending, Failed)
                | (Prepared, Active)
                | (Prepared, Failed)
                | (Active, Retired)
                | (Active, Failed)
                | (Retired, Active)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Prepared => "prepared",
            ReleaseStatus::Active => "active",
            ReleaseStatus::Retired => "retired",
            ReleaseStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A deployment step, used to report where a release failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Fetch,
    InstallDependencies,
    Migrate,
    WarmCache,
    PreCheck,
    Promote,
    Reload,
    PostCheck,
    Cancelled,
}

impl Step {
    pub fn label(&self) -> &'static str {
        match self {
            Step::Fetch => "fetch",
            Step::InstallDependencies => "install",
            Step::Migrate => "migrate",
            Step::WarmCache => "warm",
            Step::PreCheck => "pre-check",
            Step::Promote => "promote",
            Step::Reload => "reload",
            Step::PostCheck => "post-check",
            Step::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One deployable artifact instance and its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Release {
    pub id: ReleaseId,
    /// Unix timestamp (seconds) when the release slot was allocated.
    pub created_at: u64,
    /// Artifact reference as given to `deploy`.
    pub artifact: String,
    /// SHA-256 of the artifact, when it is a local file.
    pub checksum: Option<String>,
    pub status: ReleaseStatus,
    /// Step that moved this release to `failed`.
    pub failed_step: Option<Step>,
    pub failure: Option<String>,
    /// Set once the pre-promotion health gate has passed.
    pub pre_checked: bool,
    pub activated_at: Option<u64>,
    pub retired_at: Option<u64>,
}

impl Release {
    pub fn new(id: ReleaseId, artifact: &str) -> Self {
        Self {
            id,
            created_at: unix_now(),
            artifact: artifact.to_string(),
            checksum: None,
            status: ReleaseStatus::Pending,
            failed_step: None,
            failure: None,
            pre_checked: false,
            activated_at: None,
            retired_at: None,
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use ReleaseStatus::*;
        assert!(Pending.can_transition_to(Prepared));
        assert!(Prepared.can_transition_to(Active));
        assert!(Active.can_transition_to(Retired));
        assert!(Retired.can_transition_to(Active));
        assert!(Active.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Prepared));
        assert!(!Retired.can_transition_to(Prepared));
    }

    #[test]
    fn release_id_parses_and_displays() {
        let id: ReleaseId = "42".parse().unwrap();
        assert_eq!(id, ReleaseId(42));
        assert_eq!(id.to_string(), "42");
        assert!("abc".parse::<ReleaseId>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ReleaseStatus::Retired).unwrap();
        assert_eq!(json, "\"retired\"");
        let step = serde_json::to_string(&Step::InstallDependencies).unwrap();
        assert_eq!(step, "\"install_dependencies\"");
    }
}
