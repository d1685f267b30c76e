//! Deployment sequencer: drives a release through its preparation steps.
//!
//! The pipeline advances strictly `Pending → Fetched → DependenciesInstalled
//! → Migrated → CacheWarmed → Ready`. The first failing step ends it: the
//! release is recorded as `failed` with that step, nothing after it runs,
//! and the current pointer is never touched.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cutover_core::{ArtifactRef, Environment, LocalKind, Release, Step};
use cutover_exec::{
    CancelSignal, CommandContext, CommandFailure, CommandRunner, cancelled, is_cancelled,
    run_sequence,
};
use cutover_state::ReleaseStore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::DeployError;

/// Where a release is in its preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelinePhase {
    /// Slot allocated, nothing run yet.
    Pending,
    /// Artifact is in the workspace and shared paths are linked.
    Fetched,
    DependenciesInstalled,
    Migrated,
    CacheWarmed,
    /// Prepared; ready for the health gate.
    Ready,
    /// Stopped at `step`.
    Failed { step: Step },
}

impl PipelinePhase {
    /// The step that moves the pipeline out of this phase.
    pub fn next_step(self) -> Option<Step> {
        match self {
            PipelinePhase::Pending => Some(Step::Fetch),
            PipelinePhase::Fetched => Some(Step::InstallDependencies),
            PipelinePhase::DependenciesInstalled => Some(Step::Migrate),
            PipelinePhase::Migrated => Some(Step::WarmCache),
            PipelinePhase::CacheWarmed | PipelinePhase::Ready | PipelinePhase::Failed { .. } => {
                None
            }
        }
    }

    /// Phase reached once `step` succeeds. `None` for steps that run
    /// outside the preparation pipeline.
    pub fn after(step: Step) -> Option<Self> {
        match step {
            Step::Fetch => Some(PipelinePhase::Fetched),
            Step::InstallDependencies => Some(PipelinePhase::DependenciesInstalled),
            Step::Migrate => Some(PipelinePhase::Migrated),
            Step::WarmCache => Some(PipelinePhase::CacheWarmed),
            Step::PreCheck | Step::Promote | Step::Reload | Step::PostCheck | Step::Cancelled => {
                None
            }
        }
    }
}

/// A release moving through the pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    release: Release,
    phase: PipelinePhase,
}

impl Pipeline {
    pub fn new(release: Release) -> Self {
        Self {
            release,
            phase: PipelinePhase::Pending,
        }
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    pub fn release(&self) -> &Release {
        &self.release
    }

    fn complete(&mut self, step: Step) {
        if let Some(next) = PipelinePhase::after(step) {
            self.phase = next;
        }
    }

    fn fail(&mut self, step: Step) {
        self.phase = PipelinePhase::Failed { step };
    }
}

/// Why a step stopped.
#[derive(Debug)]
enum StepFailure {
    Failed(String),
    Transport(String),
    Cancelled,
}

impl From<CommandFailure> for StepFailure {
    fn from(failure: CommandFailure) -> Self {
        match failure {
            CommandFailure::Failed(reason) => StepFailure::Failed(reason),
            CommandFailure::Transport(reason) => StepFailure::Transport(reason),
        }
    }
}

pub struct DeploymentSequencer {
    env: Environment,
    store: ReleaseStore,
    runner: Arc<dyn CommandRunner>,
}

impl DeploymentSequencer {
    pub fn new(env: Environment, store: ReleaseStore, runner: Arc<dyn CommandRunner>) -> Self {
        Self { env, store, runner }
    }

    /// Environment variables every step command receives.
    pub fn step_env(&self, release: &Release) -> Vec<(String, String)> {
        let layout = self.store.layout();
        vec![
            ("CUTOVER_RELEASE_ID".to_string(), release.id.to_string()),
            (
                "CUTOVER_RELEASE_DIR".to_string(),
                layout.release_dir(release.id).display().to_string(),
            ),
            (
                "CUTOVER_SHARED_DIR".to_string(),
                layout.shared_dir().display().to_string(),
            ),
            ("CUTOVER_ARTIFACT".to_string(), release.artifact.clone()),
            ("CUTOVER_ENVIRONMENT".to_string(), self.env.name.clone()),
        ]
    }

    /// Run every preparation step for a freshly created release.
    ///
    /// Returns the release in `prepared` status. Any failure leaves it
    /// `failed` with the failing step recorded.
    pub async fn prepare(
        &self,
        release: Release,
        cancel: &mut CancelSignal,
    ) -> Result<Release, DeployError> {
        let mut pipeline = Pipeline::new(release);

        while let Some(step) = pipeline.phase().next_step() {
            if is_cancelled(cancel) {
                return Err(self.abort(&mut pipeline, step, StepFailure::Cancelled));
            }

            debug!(release = %pipeline.release().id, %step, "step started");
            let outcome = if step == Step::Migrate {
                // A started migration runs to completion; cancel is honoured after it.
                self.run_step(pipeline.release(), step).await
            } else {
                tokio::select! {
                    result = self.run_step(pipeline.release(), step) => result,
                    _ = cancelled(cancel) => Err(StepFailure::Cancelled),
                }
            };

            match outcome {
                Ok(()) => {
                    pipeline.complete(step);
                    info!(release = %pipeline.release().id, %step, "step completed");
                }
                Err(failure) => return Err(self.abort(&mut pipeline, step, failure)),
            }
        }

        let release = self.store.mark_prepared(pipeline.release().id)?;
        pipeline.phase = PipelinePhase::Ready;
        info!(release = %release.id, "release prepared");
        Ok(release)
    }

    fn abort(&self, pipeline: &mut Pipeline, step: Step, failure: StepFailure) -> DeployError {
        let id = pipeline.release().id;
        pipeline.fail(step);

        let (recorded, reason, err) = match failure {
            StepFailure::Failed(reason) => {
                (step, reason.clone(), DeployError::step_failed(step, id, reason))
            }
            StepFailure::Transport(reason) => (
                step,
                reason.clone(),
                DeployError::Transport {
                    release: Some(id),
                    step: Some(step),
                    reason,
                },
            ),
            StepFailure::Cancelled => (
                Step::Cancelled,
                format!("cancelled during {step}"),
                DeployError::Cancelled { release: id },
            ),
        };

        if let Err(e) = self.store.mark_failed(id, recorded, &reason) {
            warn!(release = %id, error = %e, "failed to record release failure");
        }
        err
    }

    async fn run_step(&self, release: &Release, step: Step) -> Result<(), StepFailure> {
        let ctx = CommandContext {
            cwd: self.store.release_dir(release.id),
            env: self.step_env(release),
            timeout: self.env.step_timeout,
        };
        let scripts = match step {
            Step::Fetch => return self.fetch(release, ctx).await,
            Step::InstallDependencies => &self.env.steps.install,
            Step::Migrate => &self.env.steps.migrate,
            Step::WarmCache => &self.env.steps.warm,
            other => {
                return Err(StepFailure::Failed(format!("{other} is not a preparation step")));
            }
        };
        run_sequence(self.runner.as_ref(), scripts, &ctx).await?;
        Ok(())
    }

    async fn fetch(&self, release: &Release, mut ctx: CommandContext) -> Result<(), StepFailure> {
        ctx.timeout = self.env.transfer_timeout;
        if self.env.steps.fetch.is_empty() {
            self.fetch_local(release, &ctx).await?;
        } else {
            run_sequence(self.runner.as_ref(), &self.env.steps.fetch, &ctx).await?;
        }

        self.store
            .layout()
            .link_shared(release.id, &self.env.shared_paths)
            .map_err(|e| StepFailure::Failed(format!("linking shared paths: {e}")))
    }

    /// Built-in fetch: copy a directory or unpack a tarball into the workspace.
    async fn fetch_local(&self, release: &Release, ctx: &CommandContext) -> Result<(), StepFailure> {
        let artifact = ArtifactRef::parse(&release.artifact)
            .map_err(|e| StepFailure::Failed(e.to_string()))?;
        let Some(path) = artifact.local_path() else {
            return Err(StepFailure::Failed(format!(
                "no fetch commands configured for {} artifacts",
                artifact.scheme()
            )));
        };
        let path = fs::canonicalize(&path)
            .map_err(|e| StepFailure::Failed(format!("{}: {e}", path.display())))?;

        if path.is_dir() {
            // Cancel (dropping this future) or a timeout stops the copy at
            // its next entry.
            let stop = StopOnDrop(Arc::new(AtomicBool::new(false)));
            let (src, dest, flag) = (path.clone(), ctx.cwd.clone(), stop.0.clone());
            let mut copy = tokio::task::spawn_blocking(move || copy_tree(&src, &dest, &flag));
            return match tokio::time::timeout(ctx.timeout, &mut copy).await {
                Ok(Ok(Ok(files))) => {
                    debug!(release = %release.id, files, "artifact copied");
                    Ok(())
                }
                Ok(Ok(Err(e))) => Err(StepFailure::Failed(format!(
                    "copying {}: {e}",
                    path.display()
                ))),
                Ok(Err(e)) => Err(StepFailure::Failed(format!("copy task failed: {e}"))),
                Err(_) => {
                    stop.0.store(true, Ordering::Relaxed);
                    let _ = copy.await;
                    Err(StepFailure::Failed(format!(
                        "copy timed out after {:?}",
                        ctx.timeout
                    )))
                }
            };
        }

        let flags = match ArtifactRef::archive_kind(&path) {
            Some(LocalKind::GzipTarball) => "-xzf",
            Some(LocalKind::Tarball) => "-xf",
            _ => {
                return Err(StepFailure::Failed(format!(
                    "unsupported artifact format: {}",
                    path.display()
                )));
            }
        };

        let hashed = path.clone();
        let checksum = tokio::task::spawn_blocking(move || sha256_file(&hashed))
            .await
            .map_err(|e| StepFailure::Failed(format!("checksum task failed: {e}")))?
            .map_err(|e| StepFailure::Failed(format!("reading {}: {e}", path.display())))?;
        if let Err(e) = self.store.set_checksum(release.id, &checksum) {
            warn!(release = %release.id, error = %e, "failed to record artifact checksum");
        }
        debug!(release = %release.id, sha256 = %checksum, "artifact checksum");

        let mut ctx = ctx.clone();
        ctx.env
            .push(("CUTOVER_ARTIFACT_PATH".to_string(), path.display().to_string()));
        let unpack = format!("tar {flags} \"$CUTOVER_ARTIFACT_PATH\" -C \"$CUTOVER_RELEASE_DIR\"");
        run_sequence(self.runner.as_ref(), &[unpack], &ctx).await?;
        Ok(())
    }
}

/// Raises the stop flag of a background copy when dropped.
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Copy a directory tree, preserving symlinks. Returns the number of files copied.
///
/// `stop` is checked before every entry; once set the copy ends with
/// `ErrorKind::Interrupted`.
fn copy_tree(src: &Path, dest: &Path, stop: &AtomicBool) -> io::Result<u64> {
    let mut files = 0;
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        if stop.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "copy stopped"));
        }
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }
    Ok(files)
}

/// SHA-256 of a file as lowercase hex.
pub(crate) fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use cutover_core::ReleaseStatus;
    use cutover_exec::{ShellRunner, cancel_pair};

    struct Fixture {
        _root: tempfile::TempDir,
        build: tempfile::TempDir,
        store: ReleaseStore,
        env: Environment,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let build = tempfile::tempdir().unwrap();
        fs::write(build.path().join("index.php"), "<?php echo 'v2';").unwrap();
        fs::create_dir(build.path().join("config")).unwrap();
        fs::write(build.path().join("config/app.php"), "<?php return [];").unwrap();

        let store = ReleaseStore::open_in_memory(root.path()).unwrap();
        let mut env = Environment::new("test", root.path());
        env.step_timeout = Duration::from_secs(10);
        Fixture {
            _root: root,
            build,
            store,
            env,
        }
    }

    fn sequencer(fx: &Fixture) -> DeploymentSequencer {
        DeploymentSequencer::new(fx.env.clone(), fx.store.clone(), Arc::new(ShellRunner::new()))
    }

    fn artifact(fx: &Fixture) -> String {
        fx.build.path().display().to_string()
    }

    fn workspace(fx: &Fixture, release: &Release) -> PathBuf {
        fx.store.release_dir(release.id)
    }

    #[test]
    fn phases_advance_in_order() {
        let mut phase = PipelinePhase::Pending;
        let mut steps = Vec::new();
        while let Some(step) = phase.next_step() {
            steps.push(step);
            phase = PipelinePhase::after(step).unwrap();
        }
        assert_eq!(
            steps,
            vec![Step::Fetch, Step::InstallDependencies, Step::Migrate, Step::WarmCache]
        );
        assert_eq!(phase, PipelinePhase::CacheWarmed);
        assert_eq!(PipelinePhase::Failed { step: Step::Fetch }.next_step(), None);
    }

    #[test]
    fn gate_steps_have_no_pipeline_phase() {
        for step in [Step::PreCheck, Step::Promote, Step::Reload, Step::PostCheck, Step::Cancelled] {
            assert_eq!(PipelinePhase::after(step), None, "{step}");
        }

        let mut pipeline = Pipeline::new(Release::new(cutover_core::ReleaseId(1), "./build"));
        pipeline.complete(Step::Fetch);
        pipeline.complete(Step::Promote);
        assert_eq!(pipeline.phase(), PipelinePhase::Fetched);
    }

    #[test]
    fn copy_tree_honours_stop_flag() {
        let fx = fixture();
        let dest = tempfile::tempdir().unwrap();

        let stop = AtomicBool::new(true);
        let err = copy_tree(fx.build.path(), dest.path(), &stop).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);

        stop.store(false, Ordering::Relaxed);
        assert_eq!(copy_tree(fx.build.path(), dest.path(), &stop).unwrap(), 2);
        assert!(dest.path().join("config/app.php").is_file());
    }

    #[test]
    fn dropping_guard_raises_stop_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        drop(StopOnDrop(flag.clone()));
        assert!(flag.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn prepares_directory_artifact() {
        let mut fx = fixture();
        fx.env.shared_paths = vec!["var/log".to_string()];
        fx.env.steps.install = vec!["mkdir vendor && echo $CUTOVER_RELEASE_ID > vendor/id".to_string()];
        fx.env.steps.migrate = vec!["touch \"$CUTOVER_SHARED_DIR/migrated\"".to_string()];
        fx.env.steps.warm = vec!["mkdir -p var/cache && touch var/cache/routes".to_string()];

        let release = fx.store.create(&artifact(&fx)).unwrap();
        let (_tx, mut cancel) = cancel_pair();
        let prepared = sequencer(&fx).prepare(release, &mut cancel).await.unwrap();

        assert_eq!(prepared.status, ReleaseStatus::Prepared);
        let ws = workspace(&fx, &prepared);
        assert!(ws.join("index.php").is_file());
        assert!(ws.join("config/app.php").is_file());
        assert_eq!(fs::read_to_string(ws.join("vendor/id")).unwrap().trim(), prepared.id.to_string());
        assert!(ws.join("var/cache/routes").is_file());
        assert!(fx.store.layout().shared_dir().join("migrated").is_file());
        assert!(fs::symlink_metadata(ws.join("var/log")).unwrap().file_type().is_symlink());
        // Nothing was promoted.
        assert_eq!(fx.store.current_id().unwrap(), None);
    }

    #[tokio::test]
    async fn unpacks_tarball_and_records_checksum() {
        let fx = fixture();
        let tarball = fx.build.path().join("shop.tar.gz");
        let status = std::process::Command::new("tar")
            .arg("-czf")
            .arg(&tarball)
            .arg("-C")
            .arg(fx.build.path())
            .arg("index.php")
            .status()
            .unwrap();
        assert!(status.success());

        let release = fx.store.create(&tarball.display().to_string()).unwrap();
        let (_tx, mut cancel) = cancel_pair();
        let prepared = sequencer(&fx).prepare(release, &mut cancel).await.unwrap();

        assert!(workspace(&fx, &prepared).join("index.php").is_file());
        let stored = fx.store.get(prepared.id).unwrap().unwrap();
        assert_eq!(stored.checksum, Some(sha256_file(&tarball).unwrap()));
        assert_eq!(stored.checksum.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn dependency_failure_stops_pipeline() {
        let mut fx = fixture();
        fx.env.steps.install = vec!["echo 'package not found' >&2; exit 2".to_string()];
        fx.env.steps.migrate = vec!["touch \"$CUTOVER_SHARED_DIR/migrated\"".to_string()];

        let release = fx.store.create(&artifact(&fx)).unwrap();
        let id = release.id;
        let (_tx, mut cancel) = cancel_pair();
        let err = sequencer(&fx).prepare(release, &mut cancel).await.unwrap_err();

        assert!(matches!(err, DeployError::Dependency { .. }));
        assert!(err.to_string().contains("package not found"));
        let stored = fx.store.get(id).unwrap().unwrap();
        assert_eq!(stored.status, ReleaseStatus::Failed);
        assert_eq!(stored.failed_step, Some(Step::InstallDependencies));
        assert!(!fx.store.layout().shared_dir().join("migrated").exists());
    }

    #[tokio::test]
    async fn migration_failure_is_reported_as_migration_error() {
        let mut fx = fixture();
        fx.env.steps.migrate = vec!["exit 1".to_string()];
        fx.env.steps.warm = vec!["touch warmed".to_string()];

        let release = fx.store.create(&artifact(&fx)).unwrap();
        let ws = workspace(&fx, &release);
        let (_tx, mut cancel) = cancel_pair();
        let err = sequencer(&fx).prepare(release, &mut cancel).await.unwrap_err();

        assert!(matches!(err, DeployError::Migration { .. }));
        assert_eq!(err.step(), Some(Step::Migrate));
        assert!(!ws.join("warmed").exists());
    }

    #[tokio::test]
    async fn warm_failure_blocks_promotion() {
        let mut fx = fixture();
        fx.env.steps.warm = vec!["false".to_string()];

        let release = fx.store.create(&artifact(&fx)).unwrap();
        let id = release.id;
        let (_tx, mut cancel) = cancel_pair();
        let err = sequencer(&fx).prepare(release, &mut cancel).await.unwrap_err();

        assert!(matches!(err, DeployError::Preparation { step: Step::WarmCache, .. }));
        assert!(fx.store.promote(id).is_err());
    }

    #[tokio::test]
    async fn step_timeout_is_step_failure() {
        let mut fx = fixture();
        fx.env.step_timeout = Duration::from_millis(100);
        fx.env.steps.install = vec!["sleep 5".to_string()];

        let release = fx.store.create(&artifact(&fx)).unwrap();
        let (_tx, mut cancel) = cancel_pair();
        let err = sequencer(&fx).prepare(release, &mut cancel).await.unwrap_err();
        assert!(matches!(err, DeployError::Dependency { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn remote_artifact_needs_fetch_commands() {
        let fx = fixture();
        let release = fx.store.create("https://builds.example.com/shop.tar.gz").unwrap();
        let (_tx, mut cancel) = cancel_pair();
        let err = sequencer(&fx).prepare(release, &mut cancel).await.unwrap_err();
        assert!(matches!(err, DeployError::Transfer { .. }));
        assert!(err.to_string().contains("no fetch commands"));
    }

    #[tokio::test]
    async fn configured_fetch_replaces_builtin() {
        let mut fx = fixture();
        fx.env.steps.fetch = vec!["echo \"$CUTOVER_ARTIFACT\" > ARTIFACT".to_string()];

        let release = fx.store.create("s3://builds/shop.tar.gz").unwrap();
        let (_tx, mut cancel) = cancel_pair();
        let prepared = sequencer(&fx).prepare(release, &mut cancel).await.unwrap();
        let recorded = fs::read_to_string(workspace(&fx, &prepared).join("ARTIFACT")).unwrap();
        assert_eq!(recorded.trim(), "s3://builds/shop.tar.gz");
    }

    #[tokio::test]
    async fn missing_artifact_is_transfer_error() {
        let fx = fixture();
        let release = fx.store.create("/nonexistent/build.tar.gz").unwrap();
        let (_tx, mut cancel) = cancel_pair();
        let err = sequencer(&fx).prepare(release, &mut cancel).await.unwrap_err();
        assert!(matches!(err, DeployError::Transfer { .. }));
    }

    #[tokio::test]
    async fn cancel_during_step_fails_release() {
        let mut fx = fixture();
        fx.env.steps.install = vec!["sleep 5".to_string()];

        let release = fx.store.create(&artifact(&fx)).unwrap();
        let id = release.id;
        let (tx, mut cancel) = cancel_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });

        let err = sequencer(&fx).prepare(release, &mut cancel).await.unwrap_err();
        assert!(matches!(err, DeployError::Cancelled { .. }));
        let stored = fx.store.get(id).unwrap().unwrap();
        assert_eq!(stored.status, ReleaseStatus::Failed);
        assert_eq!(stored.failed_step, Some(Step::Cancelled));
    }

    #[tokio::test]
    async fn broken_channel_is_transport_error() {
        let mut fx = fixture();
        fx.env.steps.install = vec!["true".to_string()];
        let release = fx.store.create(&artifact(&fx)).unwrap();
        let seq = DeploymentSequencer::new(
            fx.env.clone(),
            fx.store.clone(),
            Arc::new(ShellRunner::with_shell("/nonexistent/shell")),
        );

        let (_tx, mut cancel) = cancel_pair();
        let err = seq.prepare(release, &mut cancel).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::Transport {
                step: Some(Step::InstallDependencies),
                ..
            }
        ));
        assert_eq!(err.exit_code(), crate::error::EXIT_INDETERMINATE);
    }
}
