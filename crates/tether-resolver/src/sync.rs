//! Bulk dependency installation (`sync`).
//!
//! For each declared module: skip if the identical version is already
//! installed, package fresh from a local source override if one is
//! declared, otherwise fetch from the registry; then install. One
//! module's failure never aborts the rest — the report carries a
//! per-module summary, and sync is idempotent because project sync is
//! expected to run repeatedly.

use std::path::Path;

use semver::Version;
use tracing::{debug, info, warn};

use tether_archive::PackageArchive;
use tether_core::{ModuleCoordinate, ToolRef};
use tether_store::{ModuleStore, StoreError};

use crate::error::{ResolverError, ResolverResult};
use crate::project::ProjectConfig;
use crate::registry::RegistryFetcher;

/// One module's failure inside a sync batch.
#[derive(Debug)]
pub struct SyncFailure {
    /// The declared coordinate (`slug@version` as requested).
    pub coordinate: String,
    /// The failure, wrapped as [`ResolverError::ResolutionFailed`].
    pub error: ResolverError,
}

/// Partial-success summary of one sync run.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Modules installed by this run.
    pub installed: Vec<ModuleCoordinate>,
    /// Modules already present at the declared version.
    pub skipped: Vec<ModuleCoordinate>,
    /// Modules that failed to resolve.
    pub failed: Vec<SyncFailure>,
}

impl SyncReport {
    /// Whether every declared module resolved.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Resolve a project's declared dependency set into the store.
///
/// # Errors
///
/// Only infrastructure failures (an unreadable store) abort the batch;
/// per-module failures are collected in the report.
pub async fn sync(
    config: &ProjectConfig,
    project_root: &Path,
    store: &ModuleStore,
    fetcher: &dyn RegistryFetcher,
) -> ResolverResult<SyncReport> {
    let mut report = SyncReport::default();

    for (slug, requested_version) in &config.modules {
        let coordinate = format!("{slug}@{requested_version}");
        match sync_one(config, project_root, store, fetcher, slug, requested_version).await {
            Ok(SyncOutcome::Installed(installed)) => {
                info!(coordinate = %installed, "Installed dependency");
                report.installed.push(installed);
            }
            Ok(SyncOutcome::Skipped(existing)) => {
                debug!(coordinate = %existing, "Dependency already installed");
                report.skipped.push(existing);
            }
            Err(cause) => {
                warn!(coordinate = %coordinate, error = %cause, "Dependency resolution failed");
                report.failed.push(SyncFailure {
                    coordinate: coordinate.clone(),
                    error: ResolverError::ResolutionFailed {
                        coordinate,
                        cause: Box::new(cause),
                    },
                });
            }
        }
    }

    info!(
        installed = report.installed.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "Sync complete"
    );
    Ok(report)
}

enum SyncOutcome {
    Installed(ModuleCoordinate),
    Skipped(ModuleCoordinate),
}

async fn sync_one(
    config: &ProjectConfig,
    project_root: &Path,
    store: &ModuleStore,
    fetcher: &dyn RegistryFetcher,
    slug: &str,
    requested_version: &str,
) -> ResolverResult<SyncOutcome> {
    // Validate the declaration itself.
    let declared = ToolRef::parse(slug)?;
    if declared.version().is_some() {
        return Err(ResolverError::InvalidDeclaration(format!(
            "module key '{slug}' must be a bare slug; the version belongs in the value"
        )));
    }
    let version = Version::parse(requested_version).map_err(|e| {
        ResolverError::InvalidDeclaration(format!(
            "invalid version '{requested_version}' for '{slug}': {e}"
        ))
    })?;

    // Idempotence: an identical coordinate+version is a no-op.
    match store.lookup(slug) {
        Ok(existing) if existing.coordinate().version() == &version => {
            return Ok(SyncOutcome::Skipped(existing.coordinate().clone()));
        }
        Ok(_) | Err(StoreError::NotInstalled(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let archive = if let Some(source_dir) = config.source_for(slug, project_root) {
        // Local source override: package fresh, ignoring any remote
        // version.
        debug!(slug = %slug, path = %source_dir.display(), "Packaging from source override");
        let archive = PackageArchive::pack(&source_dir)?;
        if archive.manifest().coordinate().slug() != slug {
            return Err(ResolverError::SourceMismatch {
                declared: slug.to_string(),
                packaged: archive.manifest().coordinate().slug(),
            });
        }
        archive
    } else {
        fetcher.fetch(slug, &version).await?
    };

    let installed = store.install(&archive).await?;
    Ok(SyncOutcome::Installed(installed.coordinate().clone()))
}
