//! Orchestrator: one environment's deploy, rollback, status and prune.
//!
//! # Deploy flow
//!
//! ```text
//! lock → create slot → prepare (sequencer) → pre-check → promote
//!      → supervisor reload → post-check ──pass──→ prune → done
//!                                        └─fail──→ revert → reload → DeploymentFailed
//! ```
//!
//! Everything before `promote` leaves the serving release untouched. After
//! it, any failure (including a cancel) becomes an automatic rollback.

use std::path::PathBuf;
use std::sync::Arc;

use cutover_core::{ArtifactRef, Environment, Release, ReleaseId, Step};
use cutover_exec::{
    CancelSignal, CommandContext, CommandFailure, CommandRunner, ShellRunner, is_cancelled,
    run_sequence,
};
use cutover_health::{HealthGate, LivenessProbe, MaintenanceFlag, PostCheck, probe_for};
use cutover_state::{Layout, PruneReport, ReleaseStore, RetentionPolicy, Rollback, StateError};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::DeployError;
use crate::lock::EnvironmentLock;
use crate::sequencer::DeploymentSequencer;

/// Times a slot allocation is retried after a release-id conflict.
const CREATE_ATTEMPTS: u32 = 3;

/// Outcome of a successful deploy.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub environment: String,
    pub release: ReleaseId,
    pub previous: Option<ReleaseId>,
    pub checksum: Option<String>,
    pub probes: u32,
    pub pruned: PruneReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub environment: String,
    pub from: Option<ReleaseId>,
    pub to: ReleaseId,
}

/// Snapshot of an environment.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub environment: String,
    pub root: PathBuf,
    /// Active release according to the store.
    pub current: Option<ReleaseId>,
    /// Release the `current` symlink points at.
    pub link: Option<ReleaseId>,
    /// Store pointer and symlink agree.
    pub consistent: bool,
    pub lock_holder: Option<String>,
    pub maintenance: bool,
    pub releases: Vec<Release>,
}

pub struct Orchestrator {
    env: Environment,
    store: ReleaseStore,
    runner: Arc<dyn CommandRunner>,
    sequencer: DeploymentSequencer,
    gate: HealthGate,
}

impl Orchestrator {
    /// Open the environment root with the shell runner and the configured probe.
    ///
    /// The release store admits one process at a time; while another cutover
    /// process has it open this fails with `DeploymentInProgress`.
    pub fn open(env: Environment) -> Result<Self, DeployError> {
        let store = match ReleaseStore::open(&env.root) {
            Ok(store) => store,
            Err(StateError::Busy(db)) => {
                let holder = EnvironmentLock::holder(&Layout::new(&env.root).lock_path())
                    .unwrap_or_else(|| format!("{db} is open in another cutover process"));
                return Err(DeployError::DeploymentInProgress {
                    environment: env.name,
                    holder,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new());
        let probe = probe_for(&env.health.liveness, runner.clone(), &env.root);
        Ok(Self::new(env, store, runner, probe))
    }

    pub fn new(
        env: Environment,
        store: ReleaseStore,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        let store = store.with_retention(RetentionPolicy { keep: env.keep });
        let flag = MaintenanceFlag::new(&store.layout().maintenance_flag());
        let gate = HealthGate::new(env.health.clone(), runner.clone(), probe, flag);
        let sequencer = DeploymentSequencer::new(env.clone(), store.clone(), runner.clone());
        Self {
            env,
            store,
            runner,
            sequencer,
            gate,
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn store(&self) -> &ReleaseStore {
        &self.store
    }

    /// Prepare, verify and promote `artifact`.
    ///
    /// On error the serving release is either the one active before the call
    /// (exit code 1 and 2) or must be inspected with `status` (exit code 3).
    pub async fn deploy(
        &self,
        artifact: &str,
        cancel: &mut CancelSignal,
    ) -> Result<DeployReport, DeployError> {
        ArtifactRef::parse(artifact).map_err(|e| DeployError::InvalidArtifact(e.to_string()))?;
        let _lock =
            EnvironmentLock::acquire(&self.store.layout().lock_path(), &self.env.name, "deploy")?;

        info!(environment = %self.env.name, artifact, "deploy started");
        let release = self.prepare(artifact, cancel).await?;
        let id = release.id;

        let workspace = self.store.release_dir(id);
        let env = self.sequencer.step_env(&release);
        if !self.gate.pre_check(&release, &workspace, &env).await {
            let reason = "self-test commands failed".to_string();
            self.store.mark_failed(id, Step::PreCheck, &reason)?;
            return Err(DeployError::Preparation {
                release: id,
                step: Step::PreCheck,
                reason,
            });
        }
        let release = self.store.mark_pre_checked(id)?;

        if is_cancelled(cancel) {
            self.store.mark_failed(id, Step::Cancelled, "cancelled before promotion")?;
            return Err(DeployError::Cancelled { release: id });
        }

        // A failed swap leaves the link and the store on the previous release.
        let previous = match self.store.promote(id) {
            Ok(previous) => previous,
            Err(e) => {
                let reason = e.to_string();
                error!(environment = %self.env.name, release = %id, %reason, "promotion failed");
                if let Err(e) = self.store.mark_failed(id, Step::Promote, &reason) {
                    warn!(release = %id, error = %e, "failed to record release failure");
                }
                return Err(DeployError::Transport {
                    release: Some(id),
                    step: Some(Step::Promote),
                    reason,
                });
            }
        };
        info!(environment = %self.env.name, release = %id, previous = ?previous, "cutover complete");

        if let Err(failure) = self.reload().await {
            return Err(self
                .recover(id, previous, Step::Reload, failure.reason().to_string())
                .await);
        }

        let probes = match self
            .gate
            .post_check(&release, self.gate.settings().window, cancel)
            .await
        {
            PostCheck::Passed { probes } => probes,
            PostCheck::Failed { probes } => {
                let reason = format!(
                    "no {} consecutive healthy probes within {:?} ({probes} probes)",
                    self.gate.settings().required_successes,
                    self.gate.settings().window
                );
                return Err(self.recover(id, previous, Step::PostCheck, reason).await);
            }
            PostCheck::Cancelled => {
                return Err(self
                    .recover(id, previous, Step::Cancelled, "cancelled after promotion".to_string())
                    .await);
            }
        };

        let pruned = self.prune_quietly();
        info!(environment = %self.env.name, release = %id, probes, "deploy finished");
        Ok(DeployReport {
            environment: self.env.name.clone(),
            release: id,
            previous,
            checksum: release.checksum,
            probes,
            pruned,
        })
    }

    /// Repoint `current` to a retired release and reload the supervisor.
    pub async fn rollback(&self, to: Option<ReleaseId>) -> Result<RollbackReport, DeployError> {
        let _lock =
            EnvironmentLock::acquire(&self.store.layout().lock_path(), &self.env.name, "rollback")?;

        let Rollback { from, to } = self.store.rollback(to)?;
        self.reload().await.map_err(|failure| DeployError::Transport {
            release: Some(to),
            step: Some(Step::Reload),
            reason: failure.reason().to_string(),
        })?;
        info!(environment = %self.env.name, from = ?from, to = %to, "rollback finished");
        Ok(RollbackReport {
            environment: self.env.name.clone(),
            from,
            to,
        })
    }

    pub fn status(&self) -> Result<StatusReport, DeployError> {
        let current = self.store.current_id()?;
        let link = self.store.current_link()?;
        let layout = self.store.layout();
        Ok(StatusReport {
            environment: self.env.name.clone(),
            root: layout.root().to_path_buf(),
            current,
            link,
            consistent: current == link,
            lock_holder: EnvironmentLock::holder(&layout.lock_path()),
            maintenance: self.gate.maintenance().is_set(),
            releases: self.store.list()?,
        })
    }

    /// Apply the retention policy under the environment lock.
    pub fn prune(&self) -> Result<PruneReport, DeployError> {
        let _lock =
            EnvironmentLock::acquire(&self.store.layout().lock_path(), &self.env.name, "prune")?;
        Ok(self.store.prune()?)
    }

    /// Allocate a slot and run the preparation steps in it.
    ///
    /// A failed fetch is retried in a fresh slot; the failed one stays behind
    /// for diagnosis.
    async fn prepare(
        &self,
        artifact: &str,
        cancel: &mut CancelSignal,
    ) -> Result<Release, DeployError> {
        let mut retries = 0;
        loop {
            let release = self.create(artifact)?;
            match self.sequencer.prepare(release, cancel).await {
                Err(DeployError::Transfer { release, reason }) if retries < self.env.fetch_retries => {
                    retries += 1;
                    warn!(
                        environment = %self.env.name,
                        release = %release,
                        %reason,
                        attempt = retries,
                        "fetch failed, retrying in a fresh slot"
                    );
                }
                other => return other,
            }
        }
    }

    fn create(&self, artifact: &str) -> Result<Release, DeployError> {
        let mut attempt = 1;
        loop {
            match self.store.create(artifact) {
                Ok(release) => {
                    info!(environment = %self.env.name, release = %release.id, "release slot created");
                    return Ok(release);
                }
                Err(StateError::Conflict(id)) if attempt < CREATE_ATTEMPTS => {
                    warn!(environment = %self.env.name, release = %id, attempt, "release slot exists, allocating another");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Undo a promotion and describe what is serving now.
    async fn recover(
        &self,
        failed: ReleaseId,
        restore: Option<ReleaseId>,
        step: Step,
        reason: String,
    ) -> DeployError {
        warn!(environment = %self.env.name, release = %failed, %step, %reason, "promoted release unhealthy, rolling back");

        if let Err(e) = self.store.revert(failed, restore, step, &reason) {
            error!(environment = %self.env.name, release = %failed, error = %e, "automatic rollback failed");
            return DeployError::Transport {
                release: Some(failed),
                step: Some(step),
                reason: format!("{reason}; automatic rollback failed: {e}"),
            };
        }

        if restore.is_some() {
            if let Err(failure) = self.reload().await {
                error!(environment = %self.env.name, error = failure.reason(), "reload after rollback failed");
                return DeployError::Transport {
                    release: Some(failed),
                    step: Some(Step::Reload),
                    reason: format!("{reason}; reload after rollback failed: {}", failure.reason()),
                };
            }
        }

        if self.gate.settings().maintenance {
            if let Err(e) = self.gate.maintenance().clear() {
                warn!(error = %e, "failed to clear maintenance flag");
            }
        }

        DeployError::DeploymentFailed {
            release: failed,
            step,
            reason,
            rolled_back_to: restore,
        }
    }

    async fn reload(&self) -> Result<(), CommandFailure> {
        if self.env.supervisor.reload.is_empty() {
            return Ok(());
        }
        let layout = self.store.layout();
        let ctx = CommandContext {
            cwd: layout.root().to_path_buf(),
            env: vec![
                ("CUTOVER_ENVIRONMENT".to_string(), self.env.name.clone()),
                (
                    "CUTOVER_CURRENT".to_string(),
                    layout.current_link().display().to_string(),
                ),
            ],
            timeout: self.env.supervisor.timeout,
        };
        run_sequence(self.runner.as_ref(), &self.env.supervisor.reload, &ctx).await?;
        info!(environment = %self.env.name, "supervisor reloaded");
        Ok(())
    }

    /// Prune after a successful deploy; failures are logged, not returned.
    fn prune_quietly(&self) -> PruneReport {
        match self.store.prune() {
            Ok(report) => {
                for (id, reason) in &report.errors {
                    warn!(environment = %self.env.name, release = %id, %reason, "failed to remove release");
                }
                report
            }
            Err(e) => {
                warn!(environment = %self.env.name, error = %e, "prune after deploy failed");
                PruneReport::default()
            }
        }
    }
}
