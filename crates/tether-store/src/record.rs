//! On-disk store records.
//!
//! Each installed module owns one directory under the store root holding a
//! `record.toml` (identity, kind, environment), the current effective
//! `manifest.toml`, and — for package modules — the unpacked `code/` and
//! the isolated `env/` directory.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_core::{Manifest, ManifestOverrides, ModuleCoordinate};

use crate::env::EnvironmentRecord;

/// Record file name inside a module directory.
pub const RECORD_FILE_NAME: &str = "record.toml";

/// Current record schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// What kind of store entry a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A package install: owns code and an isolated environment.
    Package,
    /// A reference: configuration overrides on top of a base module,
    /// no code or environment of its own.
    Reference,
}

/// The persisted `record.toml` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// The module's own coordinate.
    pub coordinate: ModuleCoordinate,
    /// Entry kind.
    pub kind: RecordKind,
    /// When the entry was installed.
    pub installed_at: DateTime<Utc>,
    /// Blake3 digest of the source archive (package only), prefixed
    /// `blake3:`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// The isolated environment (package only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentRecord>,
    /// Base coordinate (reference only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<ModuleCoordinate>,
}

/// A live view of one installed store entry: the record plus the current
/// effective manifest and the directory that owns both.
#[derive(Debug, Clone)]
pub struct InstalledModule {
    /// The persisted record.
    pub record: ModuleRecord,
    /// Current effective manifest (mutable via `configure` without
    /// reinstalling). For references this carries the override maps.
    pub manifest: Manifest,
    /// The module's directory under the store root.
    pub module_dir: PathBuf,
}

impl InstalledModule {
    /// The module's coordinate.
    #[must_use]
    pub fn coordinate(&self) -> &ModuleCoordinate {
        &self.record.coordinate
    }

    /// Whether this entry is a reference module.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.record.kind == RecordKind::Reference
    }

    /// The reference's override maps, taken from its stored manifest.
    #[must_use]
    pub fn overrides(&self) -> ManifestOverrides {
        ManifestOverrides {
            configurables: self.manifest.configurables().clone(),
            tunables: self.manifest.tunables().clone(),
        }
    }
}

/// A fully resolved module, ready to execute: the requested entry plus the
/// package that provides its code and environment (the base, when the
/// entry is a reference).
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    /// The coordinate the caller asked for.
    pub coordinate: ModuleCoordinate,
    /// The package coordinate providing code and environment.
    pub provider: ModuleCoordinate,
    /// Effective manifest after applying reference overrides.
    pub manifest: Manifest,
    /// Directory of the *requested* entry (trace artifacts land here).
    pub module_dir: PathBuf,
    /// Unpacked code of the providing package.
    pub code_dir: PathBuf,
    /// Entry point within the code payload.
    pub entry_point: String,
    /// Environment directory of the providing package.
    pub env_dir: PathBuf,
    /// Environment identity of the providing package.
    pub environment: EnvironmentRecord,
}
