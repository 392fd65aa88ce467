//! The project dependency declaration (`.tether/deps.toml`).
//!
//! A project declares the modules it needs by slug and version, optional
//! local source-path overrides for development, and optional registries
//! for remote fetch:
//!
//! ```toml
//! [modules]
//! "ns/calc" = "0.1.0"
//!
//! [sources]
//! "ns/calc" = { path = "modules/calc" }
//!
//! [registries]
//! default = "https://registry.example.com"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ResolverError, ResolverResult};

/// Project-local directory holding the dependency file.
pub const PROJECT_DIR: &str = ".tether";

/// The dependency file name.
pub const DEPS_FILE_NAME: &str = "deps.toml";

/// Template written by project initialisation.
const DEPS_TEMPLATE: &str = r#"# Tether module dependencies
[modules]
# "ns/agent" = "0.1.0"
# "ns/calc" = "0.1.0"

# Optional: local sources for modules (for development)
[sources]
# "ns/calc" = { path = "modules/calc" }

# Optional: registries for fetching modules
[registries]
# default = "https://registry.example.com"
# local = "file://./packages"
"#;

/// A local source-path override: the module is packaged fresh from this
/// directory instead of being fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOverride {
    /// Source directory, relative to the project root unless absolute.
    pub path: PathBuf,
}

/// The parsed project dependency set.
///
/// Drives bulk installation only; never persisted inside the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Declared modules: slug → required version.
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
    /// Local source overrides by slug.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceOverride>,
    /// Named registries; `default` is used for remote fetch.
    #[serde(default)]
    pub registries: BTreeMap<String, String>,
}

impl ProjectConfig {
    /// Parse a dependency document.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::ProjectConfig`] on invalid TOML.
    pub fn parse(raw: &str, path: &Path) -> ResolverResult<Self> {
        toml::from_str(raw).map_err(|e| ResolverError::ProjectConfig {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load the dependency file from a project root
    /// (`<root>/.tether/deps.toml`).
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::ProjectConfig`] when the file is missing
    /// or unreadable.
    pub fn load(project_root: &Path) -> ResolverResult<Self> {
        let path = Self::deps_path(project_root);
        let raw = std::fs::read_to_string(&path).map_err(|e| ResolverError::ProjectConfig {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Self::parse(&raw, &path)
    }

    /// The dependency file path for a project root.
    #[must_use]
    pub fn deps_path(project_root: &Path) -> PathBuf {
        project_root.join(PROJECT_DIR).join(DEPS_FILE_NAME)
    }

    /// Scaffold `.tether/deps.toml` in a project root, returning the
    /// created path. An existing file is left untouched.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from creating the directory or file.
    pub fn scaffold(project_root: &Path) -> ResolverResult<PathBuf> {
        let dir = project_root.join(PROJECT_DIR);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(DEPS_FILE_NAME);
        if !path.exists() {
            std::fs::write(&path, DEPS_TEMPLATE)?;
        }
        Ok(path)
    }

    /// The source override for a slug, resolved against the project root.
    #[must_use]
    pub fn source_for(&self, slug: &str, project_root: &Path) -> Option<PathBuf> {
        self.sources.get(slug).map(|source| {
            if source.path.is_absolute() {
                source.path.clone()
            } else {
                project_root.join(&source.path)
            }
        })
    }

    /// The default registry location, if configured.
    #[must_use]
    pub fn default_registry(&self) -> Option<&str> {
        self.registries.get("default").map(String::as_str)
    }
}
