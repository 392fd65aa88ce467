//! Engine error types.
//!
//! Framework-level faults only: a module's own failures travel as
//! `error`-kind step results inside [`crate::engine::RunOutcome`], never
//! as these errors.

use std::path::PathBuf;

use tether_core::ManifestError;
use tether_store::StoreError;

/// Errors from engine runs.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store failure resolving or opening the target module.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Run-time configuration overrides conflicted with the manifest.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The trace artifact could not be written.
    #[error("failed to write trace to {path}: {message}")]
    TraceWrite {
        /// Target path of the artifact.
        path: PathBuf,
        /// Failure reason.
        message: String,
    },
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
