//! Resolver error types.

use std::path::PathBuf;

use tether_archive::ArchiveError;
use tether_core::CoordinateParseError;
use tether_store::StoreError;

/// Errors from dependency and reference resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// The project dependency file is missing or unreadable.
    #[error("project config error at {path}: {message}")]
    ProjectConfig {
        /// Path of the dependency file.
        path: PathBuf,
        /// Failure reason.
        message: String,
    },

    /// One declared module failed to resolve. Non-fatal to the batch:
    /// sibling modules are still attempted.
    #[error("resolution failed for {coordinate}: {cause}")]
    ResolutionFailed {
        /// The declared module.
        coordinate: String,
        /// Underlying failure.
        #[source]
        cause: Box<ResolverError>,
    },

    /// The registry fetch for a module failed.
    #[error("fetch failed for {coordinate}: {message}")]
    FetchFailed {
        /// The requested module.
        coordinate: String,
        /// Failure reason.
        message: String,
    },

    /// A declared local source path does not contain the declared module.
    #[error("source override for {declared} packages {packaged} instead")]
    SourceMismatch {
        /// The slug declared in the project config.
        declared: String,
        /// The slug actually packaged from the source path.
        packaged: String,
    },

    /// A reference declaration is malformed.
    #[error("invalid reference declaration: {0}")]
    InvalidDeclaration(String),

    /// The reference chain does not terminate at an installed package.
    #[error("base module not installed: {name} requires {base}")]
    BaseNotInstalled {
        /// The reference being installed.
        name: String,
        /// The missing base coordinate.
        base: String,
    },

    /// The reference chain revisits a module or exceeds the hop bound.
    #[error("reference cycle installing {name}: chain {chain:?}")]
    ReferenceCycle {
        /// The reference being installed.
        name: String,
        /// The slugs visited before the cycle was detected.
        chain: Vec<String>,
    },

    /// A coordinate or version failed to parse.
    #[error(transparent)]
    Coordinate(#[from] CoordinateParseError),

    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Archive error.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for resolver operations.
pub type ResolverResult<T> = Result<T, ResolverError>;
