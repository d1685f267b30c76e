//! cutover-health: the gate a release passes before and after cutover.
//!
//! # Architecture
//!
//! ```text
//! HealthGate
//!   ├── pre_check()  → self-test commands in the prepared workspace
//!   ├── post_check() → LivenessProbe polled until N consecutive successes
//!   │   ├── HttpProbe / CommandProbe / AlwaysHealthy
//!   │   └── ProbeTracker (consecutive successes, streak reset)
//!   └── MaintenanceFlag (raised during the first probes)
//! ```
//!
//! Every probe carries a timeout; a probe that does not answer in time is a
//! failed probe, never an unknown one.

pub mod checker;
pub mod gate;

pub use checker::{
    AlwaysHealthy, CommandProbe, HealthStatus, HttpProbe, LivenessProbe, ProbeFuture,
    ProbeResult, ProbeTracker, probe_for,
};
pub use gate::{HealthGate, MaintenanceFlag, PostCheck};
