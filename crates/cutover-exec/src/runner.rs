//! Command runner: `sh -c` with a working directory, environment, and timeout.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Boxed future alias for command runner results.
pub type RunFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, RunnerError>> + Send + 'a>>;

/// One shell command to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub script: String,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Short description of a failed run for logs and error messages.
    pub fn summary(&self) -> String {
        let detail = self
            .stderr
            .lines()
            .rev()
            .chain(self.stdout.lines().rev())
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
            .trim();
        match (self.code, detail.is_empty()) {
            (Some(code), true) => format!("exited with status {code}"),
            (Some(code), false) => format!("exited with status {code}: {detail}"),
            (None, true) => "terminated by signal".to_string(),
            (None, false) => format!("terminated by signal: {detail}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    /// The command could not be started.
    #[error("failed to start command: {0}")]
    Spawn(String),
    /// The channel to a started command broke.
    #[error("lost contact with command: {0}")]
    Io(String),
    /// The command outlived its timeout and was killed.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

impl RunnerError {
    /// Whether the failure is in the channel rather than in the command.
    pub fn is_transport(&self) -> bool {
        matches!(self, RunnerError::Spawn(_) | RunnerError::Io(_))
    }
}

/// Executes commands on the deployment target. Injected so tests can substitute it.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunFuture<'a>;
}

/// Runs commands through a local POSIX shell.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::with_shell("sh")
    }

    pub fn with_shell(shell: &str) -> Self {
        Self {
            shell: shell.to_string(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for ShellRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunFuture<'a> {
        Box::pin(async move {
            debug!(script = %spec.script, cwd = ?spec.cwd, "running command");

            let child = tokio::process::Command::new(&self.shell)
                .arg("-c")
                .arg(&spec.script)
                .current_dir(&spec.cwd)
                .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                // Dropping the future (timeout, cancel) must not leave the process behind.
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| RunnerError::Spawn(format!("{}: {e}", self.shell)))?;

            let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(RunnerError::Io(e.to_string())),
                Err(_) => return Err(RunnerError::Timeout(spec.timeout)),
            };

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Shared settings for a sequence of commands.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandContext {
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandContext {
    pub fn spec(&self, script: &str) -> CommandSpec {
        CommandSpec {
            script: script.to_string(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            timeout: self.timeout,
        }
    }
}

/// Why a command sequence stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFailure {
    /// The channel broke; the command's effect is unknown.
    Transport(String),
    /// The command ran and failed, or timed out.
    Failed(String),
}

impl CommandFailure {
    pub fn reason(&self) -> &str {
        match self {
            CommandFailure::Transport(reason) | CommandFailure::Failed(reason) => reason,
        }
    }
}

/// Run scripts in order, stopping at the first failure.
pub async fn run_sequence(
    runner: &dyn CommandRunner,
    scripts: &[String],
    ctx: &CommandContext,
) -> Result<(), CommandFailure> {
    for script in scripts {
        let spec = ctx.spec(script);
        match runner.run(&spec).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                return Err(CommandFailure::Failed(format!("`{script}` {}", output.summary())));
            }
            Err(e) if e.is_transport() => {
                return Err(CommandFailure::Transport(format!("`{script}`: {e}")));
            }
            Err(e) => return Err(CommandFailure::Failed(format!("`{script}`: {e}"))),
        }
    }
    Ok(())
}
