//! ReleaseStore: release records, workspaces, and the current pointer.
//!
//! Records live in redb; workspaces live under `releases/` in the
//! environment root. Every pointer change (promote, rollback, revert) swaps
//! the `current` symlink and commits the matching status changes in one
//! write transaction, so store readers never see zero or two active
//! releases once one has been promoted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cutover_core::{Release, ReleaseId, ReleaseStatus, Step, unix_now};
use redb::{Database, ReadableDatabase, ReadableTable, Table};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::layout::{Layout, remove_path};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// How many retired releases survive `prune`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep: cutover_core::config::DEFAULT_KEEP,
        }
    }
}

/// Result of a manual rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rollback {
    pub from: Option<ReleaseId>,
    pub to: ReleaseId,
}

/// Outcome of a prune pass. A release that failed to delete is reported,
/// not fatal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PruneReport {
    pub removed: Vec<ReleaseId>,
    pub errors: Vec<(ReleaseId, String)>,
}

/// Which release a repoint installs and what happens to the one it displaces.
struct Repoint {
    target: Option<ReleaseId>,
    accept: ReleaseStatus,
    displaced: ReleaseStatus,
    failure: Option<(Step, String)>,
    expect_current: Option<ReleaseId>,
}

/// Thread-safe release store backed by redb.
#[derive(Clone)]
pub struct ReleaseStore {
    db: Arc<Database>,
    layout: Layout,
    retention: RetentionPolicy,
}

impl ReleaseStore {
    /// Open (or create) the store for the environment rooted at `root`.
    pub fn open(root: &Path) -> StateResult<Self> {
        let layout = Layout::new(root);
        layout.ensure().map_err(map_err!(Io))?;
        let db = Database::create(layout.db_path()).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => {
                StateError::Busy(layout.db_path().display().to_string())
            }
            other => StateError::Open(other.to_string()),
        })?;
        let store = Self {
            db: Arc::new(db),
            layout,
            retention: RetentionPolicy::default(),
        };
        store.ensure_tables()?;
        debug!(root = ?root, "release store opened");
        Ok(store)
    }

    /// Keep records in memory; workspaces still live under `root` (for testing).
    pub fn open_in_memory(root: &Path) -> StateResult<Self> {
        let layout = Layout::new(root);
        layout.ensure().map_err(map_err!(Io))?;
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            layout,
            retention: RetentionPolicy::default(),
        };
        store.ensure_tables()?;
        debug!(root = ?root, "in-memory release store opened");
        Ok(store)
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RELEASES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    pub fn release_dir(&self, id: ReleaseId) -> PathBuf {
        self.layout.release_dir(id)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, id: ReleaseId) -> StateResult<Option<Release>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        read_release(&table, id)
    }

    /// All releases, oldest first.
    pub fn list(&self) -> StateResult<Vec<Release>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let release: Release =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(release);
        }
        Ok(results)
    }

    /// Id recorded in the current-pointer record.
    pub fn current_id(&self) -> StateResult<Option<ReleaseId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        Ok(meta
            .get(CURRENT)
            .map_err(map_err!(Read))?
            .map(|g| ReleaseId(g.value())))
    }

    /// The release serving traffic, read from one snapshot.
    pub fn current(&self) -> StateResult<Option<Release>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let Some(id) = meta.get(CURRENT).map_err(map_err!(Read))?.map(|g| g.value()) else {
            return Ok(None);
        };
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        read_release(&table, ReleaseId(id))
    }

    /// Release the on-disk `current` symlink resolves to.
    pub fn current_link(&self) -> StateResult<Option<ReleaseId>> {
        self.layout.read_current().map_err(map_err!(Link))
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Allocate a new release id and workspace.
    ///
    /// The id counter advances even when the slot turns out to be taken, so
    /// a caller retrying after `Conflict` receives a fresh id.
    pub fn create(&self, artifact: &str) -> StateResult<Release> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let release;
        let mut taken = false;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let next = meta
                .get(NEXT_ID)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(1);
            meta.insert(NEXT_ID, next + 1).map_err(map_err!(Write))?;

            release = Release::new(ReleaseId(next), artifact);
            let mut table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            if table.get(next).map_err(map_err!(Read))?.is_some() {
                taken = true;
            } else {
                match fs::create_dir(self.layout.release_dir(release.id)) {
                    Ok(()) => write_release(&mut table, &release)?,
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => taken = true,
                    Err(e) => return Err(StateError::Io(e.to_string())),
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        if taken {
            warn!(release = %release.id, "release slot already taken");
            return Err(StateError::Conflict(release.id));
        }
        info!(release = %release.id, artifact, "release created");
        Ok(release)
    }

    pub fn mark_prepared(&self, id: ReleaseId) -> StateResult<Release> {
        self.update(id, |release| transition(release, ReleaseStatus::Prepared))
    }

    /// Record that the pre-promotion health gate passed.
    pub fn mark_pre_checked(&self, id: ReleaseId) -> StateResult<Release> {
        self.update(id, |release| {
            if release.status != ReleaseStatus::Prepared {
                return Err(StateError::InvalidTransition {
                    release: release.id,
                    from: release.status,
                    to: ReleaseStatus::Active,
                });
            }
            release.pre_checked = true;
            Ok(())
        })
    }

    /// Move a release that never served traffic to `failed`.
    pub fn mark_failed(&self, id: ReleaseId, step: Step, reason: &str) -> StateResult<Release> {
        let release = self.update(id, |release| {
            if release.status == ReleaseStatus::Active || release.status == ReleaseStatus::Retired {
                return Err(StateError::InvalidTransition {
                    release: release.id,
                    from: release.status,
                    to: ReleaseStatus::Failed,
                });
            }
            transition(release, ReleaseStatus::Failed)?;
            release.failed_step = Some(step);
            release.failure = Some(reason.to_string());
            Ok(())
        })?;
        warn!(release = %id, %step, reason, "release failed");
        Ok(release)
    }

    pub fn set_checksum(&self, id: ReleaseId, checksum: &str) -> StateResult<Release> {
        self.update(id, |release| {
            release.checksum = Some(checksum.to_string());
            Ok(())
        })
    }

    /// Make a prepared, pre-checked release the one serving traffic.
    ///
    /// Returns the release that was active before, now `retired`.
    pub fn promote(&self, id: ReleaseId) -> StateResult<Option<ReleaseId>> {
        let previous = self.repoint(Repoint {
            target: Some(id),
            accept: ReleaseStatus::Prepared,
            displaced: ReleaseStatus::Retired,
            failure: None,
            expect_current: None,
        })?;
        info!(release = %id, previous = ?previous, "release promoted");
        Ok(previous)
    }

    /// Repoint `current` to a retired release; the displaced release is retired.
    ///
    /// Without an explicit target, the newest retired release older than the
    /// current one is chosen.
    pub fn rollback(&self, to: Option<ReleaseId>) -> StateResult<Rollback> {
        let target = match to {
            Some(id) => id,
            None => self.default_rollback_target()?,
        };
        let from = self.repoint(Repoint {
            target: Some(target),
            accept: ReleaseStatus::Retired,
            displaced: ReleaseStatus::Retired,
            failure: None,
            expect_current: None,
        })?;
        info!(from = ?from, to = %target, "rolled back");
        Ok(Rollback { from, to: target })
    }

    /// Undo a promotion whose release turned out unhealthy.
    ///
    /// `failed` must be current; it becomes `failed` and `to` (the release
    /// active before the promotion) becomes active again. With no `to`, the
    /// pointer is cleared.
    pub fn revert(
        &self,
        failed: ReleaseId,
        to: Option<ReleaseId>,
        step: Step,
        reason: &str,
    ) -> StateResult<()> {
        self.repoint(Repoint {
            target: to,
            accept: ReleaseStatus::Retired,
            displaced: ReleaseStatus::Failed,
            failure: Some((step, reason.to_string())),
            expect_current: Some(failed),
        })?;
        warn!(release = %failed, restored = ?to, %step, reason, "promotion reverted");
        Ok(())
    }

    fn default_rollback_target(&self) -> StateResult<ReleaseId> {
        let current = self.current_id()?;
        self.list()?
            .into_iter()
            .filter(|r| r.status == ReleaseStatus::Retired)
            .filter(|r| current.is_none_or(|c| r.id < c))
            .map(|r| r.id)
            .max()
            .ok_or(StateError::NoRollbackTarget)
    }

    fn repoint(&self, op: Repoint) -> StateResult<Option<ReleaseId>> {
        let now = unix_now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let previous;
        {
            let mut table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;

            previous = meta.get(CURRENT).map_err(map_err!(Read))?.map(|g| ReleaseId(g.value()));
            if let Some(expected) = op.expect_current {
                if previous != Some(expected) {
                    return Err(StateError::UnexpectedCurrent {
                        expected,
                        actual: previous,
                    });
                }
            }

            let target = match op.target {
                Some(id) => {
                    let release = read_release(&table, id)?.ok_or(StateError::NotFound(id))?;
                    if release.status != op.accept {
                        return Err(StateError::InvalidTransition {
                            release: id,
                            from: release.status,
                            to: ReleaseStatus::Active,
                        });
                    }
                    if release.status == ReleaseStatus::Prepared && !release.pre_checked {
                        return Err(StateError::NotPreChecked(id));
                    }
                    Some(release)
                }
                None => None,
            };

            if let Some(prev_id) = previous {
                if let Some(mut prev) = read_release(&table, prev_id)? {
                    if prev.status == ReleaseStatus::Active {
                        transition(&mut prev, op.displaced)?;
                        match &op.failure {
                            Some((step, reason)) => {
                                prev.failed_step = Some(*step);
                                prev.failure = Some(reason.clone());
                            }
                            None => prev.retired_at = Some(now),
                        }
                        write_release(&mut table, &prev)?;
                    }
                }
            }

            match target {
                Some(mut release) => {
                    transition(&mut release, ReleaseStatus::Active)?;
                    release.activated_at = Some(now);
                    release.retired_at = None;
                    write_release(&mut table, &release)?;
                    meta.insert(CURRENT, release.id.0).map_err(map_err!(Write))?;
                }
                None => {
                    meta.remove(CURRENT).map_err(map_err!(Write))?;
                }
            }
        }

        // The link moves first; if the commit then fails, it is moved back.
        let swapped = match op.target {
            Some(id) => self.layout.swap_current(id),
            None => self.layout.clear_current(),
        };
        swapped.map_err(map_err!(Link))?;

        if let Err(e) = txn.commit() {
            let restored = match previous {
                Some(id) => self.layout.swap_current(id),
                None => self.layout.clear_current(),
            };
            if let Err(link_err) = restored {
                warn!(error = %link_err, "failed to restore current link after aborted commit");
            }
            return Err(StateError::Transaction(e.to_string()));
        }
        Ok(previous)
    }

    // ── Retention ──────────────────────────────────────────────────

    /// Delete retired and failed releases beyond the retention policy, oldest first.
    ///
    /// A release that cannot be deleted is logged and reported; the pass
    /// continues with the rest.
    pub fn prune(&self) -> StateResult<PruneReport> {
        let keep = self.retention.keep.max(1) as usize;
        let current = self.current_id()?;
        let releases = self.list()?;

        let excess = |status: ReleaseStatus| -> Vec<ReleaseId> {
            let mut ids: Vec<ReleaseId> = releases
                .iter()
                .filter(|r| r.status == status && Some(r.id) != current)
                .map(|r| r.id)
                .collect();
            ids.sort_unstable_by(|a, b| b.cmp(a));
            ids.into_iter().skip(keep).collect()
        };

        let mut doomed = excess(ReleaseStatus::Retired);
        doomed.extend(excess(ReleaseStatus::Failed));
        doomed.sort_unstable();

        let mut report = PruneReport::default();
        for id in doomed {
            match self.purge(id) {
                Ok(()) => report.removed.push(id),
                Err(e) => {
                    warn!(release = %id, error = %e, "failed to purge release");
                    report.errors.push((id, e.to_string()));
                }
            }
        }
        info!(removed = report.removed.len(), errors = report.errors.len(), "prune finished");
        Ok(report)
    }

    fn purge(&self, id: ReleaseId) -> StateResult<()> {
        if self.current_id()? == Some(id) {
            return Err(StateError::InvalidTransition {
                release: id,
                from: ReleaseStatus::Active,
                to: ReleaseStatus::Retired,
            });
        }

        let dir = self.layout.release_dir(id);
        match remove_path(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StateError::Io(format!("{}: {e}", dir.display()))),
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            table.remove(id.0).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(release = %id, "release purged");
        Ok(())
    }

    /// Read-modify-write one release record in a single transaction.
    fn update<F>(&self, id: ReleaseId, f: F) -> StateResult<Release>
    where
        F: FnOnce(&mut Release) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let release;
        {
            let mut table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            let mut current = read_release(&table, id)?.ok_or(StateError::NotFound(id))?;
            f(&mut current)?;
            write_release(&mut table, &current)?;
            release = current;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(release)
    }
}

fn transition(release: &mut Release, next: ReleaseStatus) -> StateResult<()> {
    if !release.status.can_transition_to(next) {
        return Err(StateError::InvalidTransition {
            release: release.id,
            from: release.status,
            to: next,
        });
    }
    release.status = next;
    Ok(())
}

fn read_release<T>(table: &T, id: ReleaseId) -> StateResult<Option<Release>>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    match table.get(id.0).map_err(map_err!(Read))? {
        Some(guard) => {
            let release: Release =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(release))
        }
        None => Ok(None),
    }
}

fn write_release(table: &mut Table<'_, u64, &'static [u8]>, release: &Release) -> StateResult<()> {
    let value = serde_json::to_vec(release).map_err(map_err!(Serialize))?;
    table
        .insert(release.id.0, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}
