//! Per-environment deployment lock.
//!
//! One pipeline may run per environment. The lock is an advisory `flock` on
//! `.deploy.lock`, so a second `cutover` process (or a second orchestrator in
//! the same process) is rejected rather than queued. The kernel drops the
//! lock when its holder exits; a lock file left behind by a crashed process
//! holds no lock and is taken over by the next acquirer.
//!
//! The file's contents only describe the holder for `status` and error
//! messages.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cutover_core::unix_now;
use fs4::FileExt;
use tracing::{debug, warn};

use crate::error::DeployError;

#[derive(Debug)]
pub struct EnvironmentLock {
    path: PathBuf,
    file: File,
}

impl EnvironmentLock {
    pub fn acquire(path: &Path, environment: &str, operation: &str) -> Result<Self, DeployError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| infra(path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(DeployError::DeploymentInProgress {
                    environment: environment.to_string(),
                    holder: read_holder(&mut file).unwrap_or_else(|| "unknown holder".to_string()),
                });
            }
            Err(e) => return Err(infra(path, e)),
        }

        if let Some(stale) = read_holder(&mut file) {
            warn!(environment, path = ?path, stale = %stale, "taking over lock left by an exited process");
        }
        let holder = format!(
            "{operation} by pid {} since {}\n",
            std::process::id(),
            unix_now()
        );
        write_holder(&mut file, &holder).map_err(|e| infra(path, e))?;

        debug!(environment, path = ?path, "environment lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Description of the current holder, if the lock is taken.
    pub fn holder(path: &Path) -> Option<String> {
        let mut file = File::open(path).ok()?;
        match file.try_lock_exclusive() {
            // Nobody holds it; ours goes away with `file`.
            Ok(()) => None,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                Some(read_holder(&mut file).unwrap_or_else(|| "unknown holder".to_string()))
            }
            Err(_) => None,
        }
    }
}

impl Drop for EnvironmentLock {
    fn drop(&mut self) {
        // The flock itself is released when `file` closes.
        if let Err(e) = self.file.set_len(0) {
            warn!(path = ?self.path, error = %e, "failed to clear environment lock holder");
        }
    }
}

fn read_holder(file: &mut File) -> Option<String> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn write_holder(file: &mut File, holder: &str) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(holder.as_bytes())?;
    file.flush()
}

fn infra(path: &Path, e: io::Error) -> DeployError {
    DeployError::Transport {
        release: None,
        step: None,
        reason: format!("lock {}: {e}", path.display()),
    }
}
