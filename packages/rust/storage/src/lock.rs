//! Exclusive writer lock for a KB directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use sitekb_shared::{Result, SiteKbError};
use tracing::{debug, warn};

/// Name of the lock file inside a KB directory.
pub const LOCK_FILE: &str = ".lock";

/// Held while a build or append writes to a KB directory. The lock file is
/// removed on drop.
#[derive(Debug)]
pub struct KbLock {
    path: PathBuf,
}

impl KbLock {
    /// Take the lock for `kb_dir`, failing if another writer holds it.
    pub fn acquire(kb_dir: &Path) -> Result<Self> {
        Self::acquire_with(kb_dir, |file| {
            writeln!(file, "pid={} at={}", std::process::id(), Utc::now().to_rfc3339())
        })
    }

    /// Create the lock file and let `stamp` record the holder. The guard
    /// exists before `stamp` runs, so a failed stamp releases the lock.
    fn acquire_with(
        kb_dir: &Path,
        stamp: impl FnOnce(&mut File) -> io::Result<()>,
    ) -> Result<Self> {
        let path = kb_dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(SiteKbError::Storage(format!(
                    "knowledge base {} is locked by another writer ({}); \
                     remove {} if no build is running",
                    kb_dir.display(),
                    holder.trim(),
                    path.display()
                )));
            }
            Err(e) => return Err(SiteKbError::io(&path, e)),
        };

        let lock = Self { path };
        stamp(&mut file).map_err(|e| SiteKbError::io(&lock.path, e))?;
        debug!(path = %lock.path.display(), "lock acquired");

        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for KbLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}
