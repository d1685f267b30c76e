//! HealthGate: the checks guarding promotion and what follows it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cutover_core::{GateSettings, Release, unix_now};
use cutover_exec::{CancelSignal, CommandContext, CommandRunner, cancelled, is_cancelled, run_sequence};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::checker::{LivenessProbe, ProbeResult, ProbeTracker};

/// Verdict of the post-promotion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostCheck {
    /// Enough consecutive probes succeeded inside the window.
    Passed { probes: u32 },
    /// The window closed without enough consecutive successes.
    Failed { probes: u32 },
    /// Cancellation was requested while probing.
    Cancelled,
}

impl PostCheck {
    pub fn passed(&self) -> bool {
        matches!(self, PostCheck::Passed { .. })
    }
}

/// A file whose presence tells the reverse proxy to answer "temporarily
/// unavailable".
#[derive(Debug, Clone)]
pub struct MaintenanceFlag {
    path: PathBuf,
}

impl MaintenanceFlag {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn set(&self) -> io::Result<()> {
        fs::write(&self.path, format!("{}\n", unix_now()))?;
        info!(path = ?self.path, "maintenance flag set");
        Ok(())
    }

    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = ?self.path, "maintenance flag cleared");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_set(&self) -> bool {
        self.path.exists()
    }
}

pub struct HealthGate {
    settings: GateSettings,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn LivenessProbe>,
    flag: MaintenanceFlag,
}

impl HealthGate {
    pub fn new(
        settings: GateSettings,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn LivenessProbe>,
        flag: MaintenanceFlag,
    ) -> Self {
        Self {
            settings,
            runner,
            probe,
            flag,
        }
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    pub fn maintenance(&self) -> &MaintenanceFlag {
        &self.flag
    }

    /// Run the self-test commands against a prepared workspace.
    ///
    /// Each command is bounded by `pre_check_timeout`; a timeout counts as a
    /// failure.
    pub async fn pre_check(
        &self,
        release: &Release,
        workspace: &Path,
        env: &[(String, String)],
    ) -> bool {
        if self.settings.pre_check.is_empty() {
            debug!(release = %release.id, "no pre-check commands configured");
            return true;
        }

        let ctx = CommandContext {
            cwd: workspace.to_path_buf(),
            env: env.to_vec(),
            timeout: self.settings.pre_check_timeout,
        };
        match run_sequence(self.runner.as_ref(), &self.settings.pre_check, &ctx).await {
            Ok(()) => {
                info!(release = %release.id, "pre-check passed");
                true
            }
            Err(failure) => {
                warn!(release = %release.id, reason = failure.reason(), "pre-check failed");
                false
            }
        }
    }

    /// Poll the liveness signal after promotion.
    ///
    /// Probes every `interval` until `required_successes` consecutive
    /// successes or until `window` has elapsed. With maintenance enabled, the
    /// flag is raised before the first probe and lowered only on success.
    pub async fn post_check(
        &self,
        release: &Release,
        window: Duration,
        cancel: &mut CancelSignal,
    ) -> PostCheck {
        if self.settings.maintenance {
            if let Err(e) = self.flag.set() {
                warn!(error = %e, "failed to set maintenance flag");
            }
        }

        let deadline = Instant::now() + window;
        let mut tracker = ProbeTracker::new(self.settings.required_successes);
        info!(
            release = %release.id,
            probe = %self.probe.describe(),
            window = ?window,
            required = self.settings.required_successes,
            "post-check started"
        );

        loop {
            if is_cancelled(cancel) {
                return PostCheck::Cancelled;
            }

            let result = tokio::time::timeout(
                self.settings.probe_timeout,
                self.probe.probe(self.settings.probe_timeout),
            )
            .await
            .unwrap_or(ProbeResult::Failed);
            tracker.record(result);

            if tracker.passed() {
                if self.settings.maintenance {
                    if let Err(e) = self.flag.clear() {
                        warn!(error = %e, "failed to clear maintenance flag");
                    }
                }
                info!(release = %release.id, probes = tracker.probes(), "post-check passed");
                return PostCheck::Passed {
                    probes: tracker.probes(),
                };
            }

            if Instant::now() + self.settings.interval > deadline {
                warn!(release = %release.id, probes = tracker.probes(), "post-check window elapsed");
                return PostCheck::Failed {
                    probes: tracker.probes(),
                };
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = cancelled(cancel) => return PostCheck::Cancelled,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use cutover_core::ReleaseId;
    use cutover_exec::{ShellRunner, cancel_pair};

    use crate::checker::ProbeFuture;

    /// Replays a fixed sequence of results, repeating the last one.
    struct ScriptedProbe {
        results: Mutex<Vec<ProbeResult>>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(results: Vec<ProbeResult>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                calls: AtomicU32::new(0),
            })
        }
    }

    impl LivenessProbe for ScriptedProbe {
        fn probe(&self, _timeout: Duration) -> ProbeFuture<'_> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let results = self.results.lock().unwrap();
            let result = results.get(n).or(results.last()).copied().unwrap_or(ProbeResult::Failed);
            Box::pin(async move { result })
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn settings() -> GateSettings {
        GateSettings {
            interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(200),
            window: Duration::from_millis(300),
            required_successes: 2,
            ..GateSettings::default()
        }
    }

    fn gate(
        dir: &tempfile::TempDir,
        settings: GateSettings,
        probe: Arc<dyn LivenessProbe>,
    ) -> HealthGate {
        HealthGate::new(
            settings,
            Arc::new(ShellRunner::new()),
            probe,
            MaintenanceFlag::new(&dir.path().join("maintenance")),
        )
    }

    fn release() -> Release {
        Release::new(ReleaseId(1), "./build")
    }

    #[tokio::test]
    async fn pre_check_without_commands_passes() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir, settings(), ScriptedProbe::new(vec![]));
        assert!(gate.pre_check(&release(), dir.path(), &[]).await);
    }

    #[tokio::test]
    async fn pre_check_runs_in_workspace_with_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("artisan"), "").unwrap();
        let settings = GateSettings {
            pre_check: vec!["test -f artisan".to_string(), "test \"$APP\" = shop".to_string()],
            ..settings()
        };
        let gate = gate(&dir, settings, ScriptedProbe::new(vec![]));
        let env = vec![("APP".to_string(), "shop".to_string())];
        assert!(gate.pre_check(&release(), dir.path(), &env).await);
        assert!(!gate.pre_check(&release(), dir.path(), &[]).await);
    }

    #[tokio::test]
    async fn pre_check_timeout_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let settings = GateSettings {
            pre_check: vec!["sleep 5".to_string()],
            pre_check_timeout: Duration::from_millis(100),
            ..settings()
        };
        let gate = gate(&dir, settings, ScriptedProbe::new(vec![]));
        assert!(!gate.pre_check(&release(), dir.path(), &[]).await);
    }

    #[tokio::test]
    async fn post_check_passes_after_consecutive_successes() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ScriptedProbe::new(vec![
            ProbeResult::Failed,
            ProbeResult::Healthy,
            ProbeResult::Unhealthy,
            ProbeResult::Healthy,
            ProbeResult::Healthy,
        ]);
        let gate = gate(&dir, settings(), probe);
        let (_tx, mut rx) = cancel_pair();

        let verdict = gate.post_check(&release(), Duration::from_secs(2), &mut rx).await;
        assert_eq!(verdict, PostCheck::Passed { probes: 5 });
    }

    #[tokio::test]
    async fn post_check_fails_when_window_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir, settings(), ScriptedProbe::new(vec![ProbeResult::Unhealthy]));
        let (_tx, mut rx) = cancel_pair();

        let verdict = gate.post_check(&release(), Duration::from_millis(100), &mut rx).await;
        assert!(matches!(verdict, PostCheck::Failed { probes } if probes >= 1));
    }

    #[tokio::test]
    async fn maintenance_flag_cleared_on_success_kept_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let settings = GateSettings {
            maintenance: true,
            ..settings()
        };
        let (_tx, mut rx) = cancel_pair();

        let healthy = gate(&dir, settings.clone(), ScriptedProbe::new(vec![ProbeResult::Healthy]));
        assert!(healthy.post_check(&release(), Duration::from_secs(1), &mut rx).await.passed());
        assert!(!healthy.maintenance().is_set());

        let unhealthy = gate(&dir, settings, ScriptedProbe::new(vec![ProbeResult::Failed]));
        let verdict = unhealthy.post_check(&release(), Duration::from_millis(50), &mut rx).await;
        assert!(!verdict.passed());
        assert!(unhealthy.maintenance().is_set());
    }

    #[tokio::test]
    async fn post_check_observes_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir, settings(), ScriptedProbe::new(vec![ProbeResult::Unhealthy]));
        let (tx, mut rx) = cancel_pair();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });

        let verdict = gate.post_check(&release(), Duration::from_secs(10), &mut rx).await;
        assert_eq!(verdict, PostCheck::Cancelled);
    }
}
