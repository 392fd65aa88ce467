//! Per-coordinate store locking.
//!
//! Mutating store operations (`install`, `configure`, `uninstall`,
//! `install_reference`) serialize per `(namespace, name)` through an
//! exclusive advisory file lock, so concurrent CLI invocations touching
//! the same module never interleave while different modules proceed
//! independently. Read operations never take the lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::trace;

use crate::error::{StoreError, StoreResult};

/// An exclusive lock on one module slug, released on drop.
#[derive(Debug)]
pub struct SlugLock {
    file: File,
    path: PathBuf,
}

impl SlugLock {
    /// Acquire the lock for a slug, blocking until available.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockFailed`] when the lock file cannot be
    /// created or locked.
    pub fn acquire(locks_dir: &Path, namespace: &str, name: &str) -> StoreResult<Self> {
        let dir = locks_dir.join(namespace);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::LockFailed {
            path: dir.clone(),
            message: e.to_string(),
        })?;
        let path = dir.join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::LockFailed {
                path: path.clone(),
                message: e.to_string(),
            })?;
        file.lock_exclusive().map_err(|e| StoreError::LockFailed {
            path: path.clone(),
            message: e.to_string(),
        })?;
        trace!(path = %path.display(), "Acquired slug lock");
        Ok(Self { file, path })
    }
}

impl Drop for SlugLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            trace!(path = %self.path.display(), error = %e, "Failed to release slug lock");
        }
    }
}
