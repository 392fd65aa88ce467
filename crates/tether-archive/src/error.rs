//! Archive error types.

use std::path::PathBuf;

use tether_core::ManifestError;

/// Errors from packing, reading, and unpacking archives.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The source directory has no manifest file.
    #[error("missing manifest: no module.toml in {0}")]
    MissingManifest(PathBuf),

    /// The manifest's declared entry point is absent from the source
    /// directory.
    #[error("missing entry point '{entry_point}' in {source_dir}")]
    MissingEntryPoint {
        /// The declared entry point path.
        entry_point: String,
        /// The source directory being packed.
        source_dir: PathBuf,
    },

    /// The archive is structurally invalid.
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    /// Path traversal detected in an archive entry.
    #[error("corrupt archive: path traversal detected: {path}")]
    PathTraversal {
        /// The offending entry path.
        path: String,
    },

    /// Unsafe entry type in the archive (symlink, hardlink, device node).
    #[error("corrupt archive: unsafe entry type '{entry_type}' at {path}")]
    UnsafeEntryType {
        /// The entry type that was rejected.
        entry_type: String,
        /// The path of the entry.
        path: String,
    },

    /// The embedded manifest failed to parse.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;
