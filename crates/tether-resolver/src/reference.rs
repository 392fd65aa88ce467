//! Reference-module installation.
//!
//! A reference declaration names a new coordinate, a base module, and the
//! override maps to apply on top of the base's effective configuration:
//!
//! ```toml
//! name = "proj/agent-variant@0.1.0"
//! base_module = "ns/agent@0.1.0"
//!
//! [tunables]
//! prompt = "..."
//! ```
//!
//! Installation validates the base chain — every hop must exist, the walk
//! must terminate at a package, and revisiting a slug (or exceeding the
//! hop bound) is a cycle, rejected at install time. No code or
//! environment is copied or created.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use tether_core::{ManifestOverrides, ModuleCoordinate};
use tether_store::{InstalledModule, ModuleStore, RecordKind, StoreError};

use crate::error::{ResolverError, ResolverResult};

/// Upper bound on reference-chain length before assuming a cycle.
pub const MAX_REFERENCE_HOPS: usize = 32;

/// A parsed reference declaration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceDeclaration {
    /// The new module coordinate.
    pub name: String,
    /// The base module coordinate (with version).
    pub base_module: String,
    /// Run-varying overrides.
    #[serde(default)]
    pub tunables: BTreeMap<String, Value>,
    /// Static overrides.
    #[serde(default)]
    pub configurables: BTreeMap<String, Value>,
}

impl ReferenceDeclaration {
    /// Parse a declaration document.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::InvalidDeclaration`] on invalid TOML.
    pub fn parse(raw: &str) -> ResolverResult<Self> {
        toml::from_str(raw).map_err(|e| ResolverError::InvalidDeclaration(e.to_string()))
    }

    /// Load a declaration from a file.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::InvalidDeclaration`] on unreadable or
    /// invalid input.
    pub fn load(path: &Path) -> ResolverResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ResolverError::InvalidDeclaration(format!("{}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    /// The declaration's override maps.
    #[must_use]
    pub fn overrides(&self) -> ManifestOverrides {
        ManifestOverrides {
            configurables: self.configurables.clone(),
            tunables: self.tunables.clone(),
        }
    }
}

/// Validate a reference declaration against the store and install it.
///
/// # Errors
///
/// Returns [`ResolverError::BaseNotInstalled`] when the chain does not
/// terminate at an installed package and [`ResolverError::ReferenceCycle`]
/// when it revisits a slug or exceeds [`MAX_REFERENCE_HOPS`].
pub async fn install_reference(
    store: &ModuleStore,
    declaration: &ReferenceDeclaration,
) -> ResolverResult<InstalledModule> {
    let name = ModuleCoordinate::parse(&declaration.name)?;
    let base = ModuleCoordinate::parse(&declaration.base_module)?;

    validate_base_chain(store, &name, &base)?;

    let installed = store
        .install_reference(&name, &base, &declaration.overrides())
        .await?;
    info!(coordinate = %name, base = %base, "Reference module installed");
    Ok(installed)
}

/// Walk the base chain, rejecting missing bases and cycles.
fn validate_base_chain(
    store: &ModuleStore,
    name: &ModuleCoordinate,
    base: &ModuleCoordinate,
) -> ResolverResult<()> {
    let mut visited = vec![name.slug()];
    let mut current = base.clone();

    for _ in 0..MAX_REFERENCE_HOPS {
        let slug = current.slug();
        if visited.contains(&slug) {
            return Err(ResolverError::ReferenceCycle {
                name: name.to_string(),
                chain: visited,
            });
        }
        visited.push(slug.clone());

        let entry = store.lookup(&slug).map_err(|e| match e {
            StoreError::NotInstalled(_) => ResolverError::BaseNotInstalled {
                name: name.to_string(),
                base: current.to_string(),
            },
            other => other.into(),
        })?;

        match entry.record.kind {
            RecordKind::Package => return Ok(()),
            RecordKind::Reference => {
                current = entry.record.base.clone().ok_or_else(|| {
                    ResolverError::Store(StoreError::CorruptRecord {
                        path: entry.module_dir.join("record.toml"),
                        message: "reference record without base".to_string(),
                    })
                })?;
            }
        }
    }

    Err(ResolverError::ReferenceCycle {
        name: name.to_string(),
        chain: visited,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_declaration() {
        let raw = concat!(
            "name = \"proj/agent-variant@0.1.0\"\n",
            "base_module = \"ns/agent@0.1.0\"\n\n",
            "[tunables]\nprompt = \"custom\"\n",
        );
        let declaration = ReferenceDeclaration::parse(raw).unwrap();
        assert_eq!(declaration.name, "proj/agent-variant@0.1.0");
        assert_eq!(declaration.base_module, "ns/agent@0.1.0");
        assert_eq!(
            declaration.overrides().tunables["prompt"],
            serde_json::json!("custom")
        );
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(matches!(
            ReferenceDeclaration::parse("name = \"proj/x@0.1.0\"\n"),
            Err(ResolverError::InvalidDeclaration(_))
        ));
    }
}
