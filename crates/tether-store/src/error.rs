//! Store error types.

use std::path::PathBuf;
use std::time::Duration;

use tether_archive::ArchiveError;
use tether_core::ManifestError;

/// Errors from store and environment operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The isolated execution environment could not be created.
    #[error("environment provisioning failed for {coordinate}: {message}")]
    EnvironmentProvisionFailed {
        /// The module being installed.
        coordinate: String,
        /// Failure reason.
        message: String,
    },

    /// The environment could not satisfy the declared requirement list.
    #[error("dependency installation failed for {coordinate}: {message}")]
    DependencyInstallFailed {
        /// The module being installed.
        coordinate: String,
        /// Failure reason.
        message: String,
    },

    /// No module is installed under the requested name.
    #[error("module not installed: {0}")]
    NotInstalled(String),

    /// A reference module points at a base that is no longer installed.
    #[error("dangling reference: {name} points at uninstalled base {base}")]
    DanglingReference {
        /// The reference module's name.
        name: String,
        /// The missing base coordinate.
        base: String,
    },

    /// A single-hop resolution landed on a reference whose base is itself
    /// a reference; callers needing deep chains must resolve iteratively.
    #[error("reference {name} resolves to another reference {base}; resolve iteratively")]
    UnresolvedReference {
        /// The reference module's name.
        name: String,
        /// The base, which is itself a reference.
        base: String,
    },

    /// Iterative resolution revisited a slug or exceeded the hop bound.
    #[error("reference cycle resolving {name}: chain {chain:?}")]
    ReferenceCycle {
        /// The name being resolved.
        name: String,
        /// The slugs visited before the cycle was detected.
        chain: Vec<String>,
    },

    /// A store record on disk failed to parse.
    #[error("corrupt store record at {path}: {message}")]
    CorruptRecord {
        /// Path of the unreadable record.
        path: PathBuf,
        /// Parse error message.
        message: String,
    },

    /// A module invocation failed at the environment boundary.
    #[error("invocation failed: {0}")]
    InvokeFailed(String),

    /// The invocation deadline elapsed and the execution unit was killed.
    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),

    /// Failed to acquire the per-coordinate store lock.
    #[error("failed to lock {path}: {message}")]
    LockFailed {
        /// The lock file path.
        path: PathBuf,
        /// Failure reason.
        message: String,
    },

    /// Archive error during install.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Manifest error while merging or persisting configuration.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
