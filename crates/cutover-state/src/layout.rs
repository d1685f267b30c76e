//! On-disk layout of an environment root.
//!
//! ```text
//! <root>/
//!   state.redb
//!   current -> releases/<id>
//!   releases/<id>/
//!   shared/
//!   .deploy.lock
//!   maintenance
//! ```

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use cutover_core::ReleaseId;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Create the releases and shared directories if they don't exist yet.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(self.releases_dir())?;
        fs::create_dir_all(self.shared_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("state.redb")
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.root.join("releases")
    }

    pub fn release_dir(&self, id: ReleaseId) -> PathBuf {
        self.releases_dir().join(id.to_string())
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.root.join("shared")
    }

    pub fn current_link(&self) -> PathBuf {
        self.root.join("current")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".deploy.lock")
    }

    pub fn maintenance_flag(&self) -> PathBuf {
        self.root.join("maintenance")
    }

    /// Point `current` at a release in one step.
    ///
    /// The new link is written under a temporary name and renamed over
    /// `current`; `rename(2)` replaces the old link atomically, so a reader
    /// resolving `current` sees the old or the new release and nothing else.
    pub fn swap_current(&self, id: ReleaseId) -> io::Result<()> {
        let tmp = self.root.join(format!(".current.{id}.tmp"));
        match fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        symlink(Path::new("releases").join(id.to_string()), &tmp)?;
        if let Err(e) = fs::rename(&tmp, self.current_link()) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        debug!(release = %id, "current link swapped");
        Ok(())
    }

    /// Remove the `current` link.
    pub fn clear_current(&self) -> io::Result<()> {
        match fs::remove_file(self.current_link()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Release the `current` link points at, if any.
    pub fn read_current(&self) -> io::Result<Option<ReleaseId>> {
        let target = match fs::read_link(self.current_link()) {
            Ok(target) => target,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(target
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse().ok()))
    }

    /// Link each shared path into a release workspace.
    ///
    /// A shared path missing from `shared/` is seeded from the release when
    /// the artifact ships it, otherwise created as an empty directory.
    pub fn link_shared(&self, id: ReleaseId, paths: &[String]) -> io::Result<()> {
        let release = self.release_dir(id);
        for rel in paths {
            let shared = self.shared_dir().join(rel);
            let local = release.join(rel);

            if let Some(parent) = shared.parent() {
                fs::create_dir_all(parent)?;
            }
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent)?;
            }

            let local_exists = fs::symlink_metadata(&local).is_ok();
            if fs::symlink_metadata(&shared).is_err() {
                if local_exists {
                    fs::rename(&local, &shared)?;
                } else {
                    fs::create_dir_all(&shared)?;
                }
            } else if local_exists {
                remove_path(&local)?;
            }

            symlink(&shared, &local)?;
            debug!(release = %id, path = %rel, "shared path linked");
        }
        Ok(())
    }
}

/// Remove a file, symlink, or directory tree.
pub(crate) fn remove_path(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}
