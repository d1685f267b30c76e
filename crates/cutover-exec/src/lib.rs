//! cutover-exec: the channel through which cutover runs external commands.
//!
//! Every preparation step, pre-check, supervisor reload and command-based
//! liveness probe goes through a [`CommandRunner`]. The runner separates a
//! broken channel (the command could not be started or read) from a command
//! that ran and failed, because the former leaves the host in an unknown
//! state while the latter is an ordinary step failure.

pub mod cancel;
pub mod runner;

pub use cancel::{CancelSignal, Canceller, cancel_pair, cancelled, is_cancelled};
pub use runner::{
    CommandContext, CommandFailure, CommandOutput, CommandRunner, CommandSpec, RunFuture,
    RunnerError, ShellRunner, run_sequence,
};
