//! The opaque registry-fetch seam.
//!
//! The resolver does not care where archives come from; it asks a
//! [`RegistryFetcher`] for a coordinate and receives a validated
//! [`PackageArchive`]. Implementations here cover a directory of
//! `.tether` files (the `file://` registries of project configs) and a
//! thin HTTP client. The registry *service* — search, upload, usage
//! statistics — is an external collaborator and has no presence here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use semver::Version;
use tracing::debug;

use tether_archive::PackageArchive;

use crate::error::{ResolverError, ResolverResult};
use crate::project::ProjectConfig;

/// Fetches a module's package archive by slug and version.
#[async_trait]
pub trait RegistryFetcher: Send + Sync {
    /// Fetch the archive for `slug` at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::FetchFailed`] when the module cannot be
    /// retrieved.
    async fn fetch(&self, slug: &str, version: &Version) -> ResolverResult<PackageArchive>;
}

/// A registry backed by a directory of `.tether` files named
/// `<ns>_<name>-<version>.tether`.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    dir: PathBuf,
}

impl FileRegistry {
    /// A registry over `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RegistryFetcher for FileRegistry {
    async fn fetch(&self, slug: &str, version: &Version) -> ResolverResult<PackageArchive> {
        let file_name = format!("{}-{version}.tether", slug.replace('/', "_"));
        let path = self.dir.join(&file_name);
        debug!(path = %path.display(), "Fetching archive from file registry");
        if !path.is_file() {
            return Err(ResolverError::FetchFailed {
                coordinate: format!("{slug}@{version}"),
                message: format!("not found in registry directory: {}", path.display()),
            });
        }
        Ok(PackageArchive::read_from(&path)?)
    }
}

/// A thin HTTP registry client:
/// `GET <base>/packages/<ns>/<name>/<version>` returning archive bytes.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRegistry {
    /// A client for the registry at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RegistryFetcher for HttpRegistry {
    async fn fetch(&self, slug: &str, version: &Version) -> ResolverResult<PackageArchive> {
        let coordinate = format!("{slug}@{version}");
        let url = format!(
            "{}/packages/{slug}/{version}",
            self.base_url.trim_end_matches('/')
        );
        debug!(url = %url, "Fetching archive from HTTP registry");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ResolverError::FetchFailed {
                coordinate: coordinate.clone(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ResolverError::FetchFailed {
                coordinate,
                message: format!("registry returned {}", response.status()),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ResolverError::FetchFailed {
                coordinate: coordinate.clone(),
                message: e.to_string(),
            })?;
        Ok(PackageArchive::from_bytes(bytes.to_vec())?)
    }
}

/// A fetcher for projects with no configured registry: every fetch fails,
/// pointing the user at `[sources]` or `[registries]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRegistry;

#[async_trait]
impl RegistryFetcher for NoRegistry {
    async fn fetch(&self, slug: &str, version: &Version) -> ResolverResult<PackageArchive> {
        Err(ResolverError::FetchFailed {
            coordinate: format!("{slug}@{version}"),
            message: "no registry configured; add a [registries] entry or a [sources] override"
                .to_string(),
        })
    }
}

/// Build the fetcher a project's `[registries]` table selects.
///
/// `file://` locations become a [`FileRegistry`] (relative paths resolved
/// against the project root); anything else becomes an [`HttpRegistry`];
/// no configuration yields [`NoRegistry`].
#[must_use]
pub fn registry_from_config(
    config: &ProjectConfig,
    project_root: &Path,
) -> Box<dyn RegistryFetcher> {
    match config.default_registry() {
        Some(location) => {
            if let Some(raw_path) = location.strip_prefix("file://") {
                let path = Path::new(raw_path);
                let dir = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    project_root.join(path)
                };
                Box::new(FileRegistry::new(dir))
            } else {
                Box::new(HttpRegistry::new(location))
            }
        }
        None => Box::new(NoRegistry),
    }
}
