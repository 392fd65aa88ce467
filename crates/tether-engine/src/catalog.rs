//! Tool discovery.
//!
//! Before running a module that declares a non-empty `tool_list`, the
//! engine matches each declared reference against the store's installed
//! modules and exposes the matches — with their manifests' human-readable
//! descriptions — to the module's steps. Unmatched references are omitted
//! from the catalog (not fatal) and surfaced as trace warnings.

use tether_core::{ToolCatalogEntry, ToolRef};
use tether_store::InstalledModule;

/// Match declared tool references against installed modules.
///
/// Returns the catalog of matches plus one warning per unmatched
/// reference.
#[must_use]
pub fn build_catalog(
    tool_refs: &[ToolRef],
    installed: &[InstalledModule],
) -> (Vec<ToolCatalogEntry>, Vec<String>) {
    let mut catalog = Vec::new();
    let mut warnings = Vec::new();

    for tool_ref in tool_refs {
        match installed
            .iter()
            .find(|module| tool_ref.matches(module.coordinate()))
        {
            Some(module) => catalog.push(ToolCatalogEntry {
                coordinate: module.coordinate().clone(),
                description: module.manifest.description().to_string(),
                long_description: module.manifest.long_description().to_string(),
            }),
            None => warnings.push(format!("declared tool {tool_ref} is not installed")),
        }
    }

    (catalog, warnings)
}

/// Whether a requested tool is covered by the declared tool list.
#[must_use]
pub fn is_declared(requested: &ToolRef, declared: &[ToolRef]) -> bool {
    declared.iter().any(|d| {
        d.slug() == requested.slug()
            && match (d.version(), requested.version()) {
                (_, None) | (None, _) => true,
                (Some(declared_version), Some(requested_version)) => {
                    declared_version == requested_version
                }
            }
    })
}
