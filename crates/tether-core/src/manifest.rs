//! The module manifest model.
//!
//! A manifest (`module.toml`) describes a module's identity and its two
//! disjoint configuration maps: `configurables` (static settings such as a
//! tool allowlist) and `tunables` (settings expected to vary across runs,
//! such as prompt text). The document's single top-level key is the
//! module's coordinate in string form:
//!
//! ```toml
//! ["ns/calc@0.1.0"]
//! description = "Evaluates arithmetic expressions."
//! entry_point = "calc"
//!
//! ["ns/calc@0.1.0".requires]
//! mathkit = "^1.2"
//!
//! ["ns/calc@0.1.0".configurables]
//! tool_list = []
//!
//! ["ns/calc@0.1.0".tunables]
//! prompt = "..."
//! ```

use std::collections::BTreeMap;

use semver::VersionReq;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::coordinate::{CoordinateParseError, ModuleCoordinate, ToolRef};

/// Standard manifest file name.
pub const MANIFEST_FILE_NAME: &str = "module.toml";

/// Default entry point when the manifest does not declare one.
const DEFAULT_ENTRY_POINT: &str = "main";

/// The configurable key naming the module's declared tools.
pub const TOOL_LIST_KEY: &str = "tool_list";

/// Errors from manifest parsing and merging.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The manifest document is structurally invalid.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    /// A key appears in both `configurables` and `tunables`.
    #[error("conflicting key '{0}': present in both configurables and tunables")]
    ConflictingKey(String),

    /// The manifest's coordinate key failed to parse.
    #[error("malformed manifest: {0}")]
    InvalidCoordinate(#[from] CoordinateParseError),
}

/// Result type for manifest operations.
pub type ManifestResult<T> = Result<T, ManifestError>;

/// A dependency requirement declared by a module: a package name and a
/// semver constraint the isolated environment must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// The required package name.
    pub name: String,
    /// The version constraint.
    pub constraint: VersionReq,
}

/// The serde shape of the table under the coordinate key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ManifestBody {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    long_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entry_point: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    requires: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    configurables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    tunables: BTreeMap<String, Value>,
}

/// A parsed module manifest.
///
/// Values in the configuration maps are scalars, strings, lists, or nested
/// maps — never executable content. The two maps are disjoint by
/// invariant; both [`Manifest::parse`] and [`Manifest::merged`] enforce it.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    coordinate: ModuleCoordinate,
    description: String,
    long_description: String,
    entry_point: String,
    requires: Vec<Requirement>,
    configurables: BTreeMap<String, Value>,
    tunables: BTreeMap<String, Value>,
}

/// Partial override maps applied on top of a base manifest by `configure`,
/// reference modules, and run-time configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestOverrides {
    /// Static configuration overrides.
    #[serde(default)]
    pub configurables: BTreeMap<String, Value>,
    /// Run-varying configuration overrides.
    #[serde(default)]
    pub tunables: BTreeMap<String, Value>,
}

impl ManifestOverrides {
    /// Whether there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.configurables.is_empty() && self.tunables.is_empty()
    }
}

impl Manifest {
    /// Build the stored manifest of a reference module: the reference's
    /// own coordinate carrying only the override maps.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::ConflictingKey`] if a key appears in both
    /// override maps.
    pub fn from_overrides(
        coordinate: ModuleCoordinate,
        overrides: &ManifestOverrides,
    ) -> ManifestResult<Self> {
        let manifest = Self {
            coordinate,
            description: String::new(),
            long_description: String::new(),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            requires: Vec::new(),
            configurables: overrides.configurables.clone(),
            tunables: overrides.tunables.clone(),
        };
        manifest.check_disjoint()?;
        Ok(manifest)
    }

    /// Parse a manifest document.
    ///
    /// The document must contain exactly one top-level table whose key is
    /// the module coordinate in string form.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::MalformedManifest`] on invalid TOML, a
    /// missing or duplicated top-level key, or an invalid requirement
    /// constraint; [`ManifestError::InvalidCoordinate`] if the key is not
    /// a coordinate; [`ManifestError::ConflictingKey`] if a key appears in
    /// both configuration maps.
    pub fn parse(raw: &str) -> ManifestResult<Self> {
        let document: BTreeMap<String, ManifestBody> = toml::from_str(raw)
            .map_err(|e| ManifestError::MalformedManifest(e.to_string()))?;

        let mut entries = document.into_iter();
        let (key, body) = entries.next().ok_or_else(|| {
            ManifestError::MalformedManifest("no module table in manifest".to_string())
        })?;
        if entries.next().is_some() {
            return Err(ManifestError::MalformedManifest(
                "manifest must contain exactly one module table".to_string(),
            ));
        }

        let coordinate = ModuleCoordinate::parse(&key)?;

        let mut requires = Vec::with_capacity(body.requires.len());
        for (name, constraint) in body.requires {
            let constraint = VersionReq::parse(&constraint).map_err(|e| {
                ManifestError::MalformedManifest(format!(
                    "invalid requirement '{name} = \"{constraint}\"': {e}"
                ))
            })?;
            requires.push(Requirement { name, constraint });
        }

        let manifest = Self {
            coordinate,
            description: body.description,
            long_description: body.long_description,
            entry_point: body
                .entry_point
                .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string()),
            requires,
            configurables: body.configurables,
            tunables: body.tunables,
        };
        manifest.check_disjoint()?;
        Ok(manifest)
    }

    /// Serialize back to the `module.toml` document form.
    ///
    /// Used to persist the *effective* manifest after `configure`; the
    /// output parses back to an equal manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::MalformedManifest`] if a configuration
    /// value cannot be represented in TOML (e.g. a JSON `null`).
    pub fn to_toml_string(&self) -> ManifestResult<String> {
        let body = ManifestBody {
            description: self.description.clone(),
            long_description: self.long_description.clone(),
            entry_point: Some(self.entry_point.clone()),
            requires: self
                .requires
                .iter()
                .map(|r| (r.name.clone(), r.constraint.to_string()))
                .collect(),
            configurables: self.configurables.clone(),
            tunables: self.tunables.clone(),
        };
        let document: BTreeMap<String, ManifestBody> =
            [(self.coordinate.to_string(), body)].into_iter().collect();
        toml::to_string_pretty(&document)
            .map_err(|e| ManifestError::MalformedManifest(e.to_string()))
    }

    /// Merge override maps on top of this manifest, producing a new one.
    ///
    /// Override keys win per-field; unknown override keys are added. Pure:
    /// neither input is mutated.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::ConflictingKey`] if the result would hold
    /// the same key in both configuration maps.
    pub fn merged(&self, overrides: &ManifestOverrides) -> ManifestResult<Self> {
        let mut merged = self.clone();
        for (key, value) in &overrides.configurables {
            merged.configurables.insert(key.clone(), value.clone());
        }
        for (key, value) in &overrides.tunables {
            merged.tunables.insert(key.clone(), value.clone());
        }
        merged.check_disjoint()?;
        Ok(merged)
    }

    /// Validate the configurables/tunables disjointness invariant.
    fn check_disjoint(&self) -> ManifestResult<()> {
        for key in self.configurables.keys() {
            if self.tunables.contains_key(key) {
                return Err(ManifestError::ConflictingKey(key.clone()));
            }
        }
        Ok(())
    }

    /// The module's coordinate.
    #[must_use]
    pub fn coordinate(&self) -> &ModuleCoordinate {
        &self.coordinate
    }

    /// Short human-readable description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Long-form description, surfaced to calling modules via the tool
    /// catalog.
    #[must_use]
    pub fn long_description(&self) -> &str {
        &self.long_description
    }

    /// Relative path of the entry point within the code payload.
    #[must_use]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// The declared dependency requirements.
    #[must_use]
    pub fn requires(&self) -> &[Requirement] {
        &self.requires
    }

    /// Static configuration map.
    #[must_use]
    pub fn configurables(&self) -> &BTreeMap<String, Value> {
        &self.configurables
    }

    /// Run-varying configuration map.
    #[must_use]
    pub fn tunables(&self) -> &BTreeMap<String, Value> {
        &self.tunables
    }

    /// The declared tool references from the `tool_list` configurable.
    ///
    /// Entries that are not strings or do not parse as tool references are
    /// skipped with a warning; an absent or non-array `tool_list` yields
    /// an empty list.
    #[must_use]
    pub fn tool_list(&self) -> Vec<ToolRef> {
        let Some(Value::Array(entries)) = self.configurables.get(TOOL_LIST_KEY) else {
            return Vec::new();
        };
        let mut refs = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Value::String(spec) => match ToolRef::parse(spec) {
                    Ok(tool_ref) => refs.push(tool_ref),
                    Err(e) => {
                        warn!(coordinate = %self.coordinate, entry = %spec, error = %e,
                            "Skipping unparseable tool_list entry");
                    }
                },
                other => {
                    warn!(coordinate = %self.coordinate, ?other,
                        "Skipping non-string tool_list entry");
                }
            }
        }
        refs
    }
}
