//! The module store: single source of truth for what is installed.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/modules/<ns>/<name>/   one entry per slug
//!     record.toml               identity, kind, environment
//!     manifest.toml             current effective manifest
//!     code/                     unpacked payload        (package only)
//!     env/                      isolated environment    (package only)
//!     traces/                   execution trace artifacts
//! <root>/locks/<ns>/<name>.lock
//! <root>/staging/<uuid>/        installs prepared here, then swapped in
//! <root>/trash/<uuid>/          superseded entries on their way out
//! ```
//!
//! Installs are all-or-nothing: the staging directory is fully prepared
//! (unpack, environment provisioning, dependency installation, records)
//! before the live directory is touched, so a failure mid-install leaves
//! any previous installation intact and resolvable.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_archive::PackageArchive;
use tether_core::{
    Manifest, ManifestOverrides, ModuleCoordinate, ToolRef, MANIFEST_FILE_NAME,
};

use crate::env::{Environment, EnvironmentProvider};
use crate::error::{StoreError, StoreResult};
use crate::lock::SlugLock;
use crate::record::{
    InstalledModule, ModuleRecord, RecordKind, ResolvedModule, RECORD_FILE_NAME, SCHEMA_VERSION,
};

/// Code payload directory inside a module entry.
const CODE_DIR: &str = "code";

/// Environment directory inside a module entry.
const ENV_DIR: &str = "env";

/// Trace artifact directory inside a module entry.
const TRACES_DIR: &str = "traces";

/// The on-disk module store.
pub struct ModuleStore {
    root: PathBuf,
    provider: Arc<dyn EnvironmentProvider>,
}

impl ModuleStore {
    /// Open (creating if needed) a store at `root`.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from creating the store layout.
    pub fn open(root: impl Into<PathBuf>, provider: Arc<dyn EnvironmentProvider>) -> StoreResult<Self> {
        let root = root.into();
        for dir in ["modules", "locks", "staging", "trash"] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root, provider })
    }

    /// The default store root: `~/.tether`, or `.tether` when no home
    /// directory is available.
    #[must_use]
    pub fn default_root() -> PathBuf {
        directories::BaseDirs::new()
            .map_or_else(|| PathBuf::from(".tether"), |dirs| dirs.home_dir().join(".tether"))
    }

    /// The store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn modules_dir(&self) -> PathBuf {
        self.root.join("modules")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn module_dir(&self, namespace: &str, name: &str) -> PathBuf {
        self.modules_dir().join(namespace).join(name)
    }

    /// Install a package archive, superseding any prior entry at the same
    /// slug.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EnvironmentProvisionFailed`] or
    /// [`StoreError::DependencyInstallFailed`] from environment setup;
    /// archive and I/O errors otherwise. On any error the previous
    /// installation, if one existed, is left untouched.
    pub async fn install(&self, archive: &PackageArchive) -> StoreResult<InstalledModule> {
        let coordinate = archive.manifest().coordinate().clone();
        let _lock = SlugLock::acquire(&self.locks_dir(), coordinate.namespace(), coordinate.name())?;

        let staging = self.root.join("staging").join(Uuid::new_v4().to_string());
        if let Err(e) = self.stage_install(archive, &coordinate, &staging).await {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        let live = self.module_dir(coordinate.namespace(), coordinate.name());
        if let Err(e) = self.swap_into_place(&coordinate, &staging, &live).await {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        info!(coordinate = %coordinate, "Installed module");
        self.read_installed(&live)
    }

    /// Prepare a complete module entry in `staging`.
    async fn stage_install(
        &self,
        archive: &PackageArchive,
        coordinate: &ModuleCoordinate,
        staging: &Path,
    ) -> StoreResult<()> {
        let code_dir = staging.join(CODE_DIR);
        archive.unpack(&code_dir)?;
        std::fs::create_dir_all(staging.join(TRACES_DIR))?;

        let env_dir = staging.join(ENV_DIR);
        let environment = self.provider.provision(
            coordinate,
            &env_dir,
            &code_dir,
            archive.manifest().entry_point(),
        )?;

        if let Err(e) = environment
            .install_dependencies(archive.manifest().requires())
            .await
        {
            if let Err(destroy_error) = environment.destroy().await {
                warn!(coordinate = %coordinate, error = %destroy_error,
                    "Failed to destroy environment after staging failure");
            }
            return Err(e);
        }

        std::fs::write(
            staging.join(MANIFEST_FILE_NAME),
            archive.manifest().to_toml_string()?,
        )?;
        let record = ModuleRecord {
            schema_version: SCHEMA_VERSION,
            coordinate: coordinate.clone(),
            kind: RecordKind::Package,
            installed_at: Utc::now(),
            digest: Some(format!("blake3:{}", archive.digest())),
            environment: Some(environment.record().clone()),
            base: None,
        };
        write_record(staging, &record)?;
        Ok(())
    }

    /// Swap a fully staged entry into the live slot, retiring any
    /// superseded entry. Caller holds the slug lock.
    async fn swap_into_place(
        &self,
        coordinate: &ModuleCoordinate,
        staging: &Path,
        live: &Path,
    ) -> StoreResult<()> {
        if let Some(parent) = live.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if live.exists() {
            let superseded = read_record(live).ok();
            let trash = self.root.join("trash").join(Uuid::new_v4().to_string());
            std::fs::rename(live, &trash)?;
            if let Err(e) = std::fs::rename(staging, live) {
                // Put the previous entry back before failing.
                let _ = std::fs::rename(&trash, live);
                let _ = std::fs::remove_dir_all(staging);
                return Err(e.into());
            }
            if let Some(old) = superseded {
                debug!(coordinate = %coordinate, superseded = %old.coordinate,
                    "Superseded prior installation");
                self.retire_entry(&old, &trash).await;
            }
            let _ = std::fs::remove_dir_all(&trash);
        } else {
            std::fs::rename(staging, live)?;
        }
        Ok(())
    }

    /// Destroy a retired entry's environment, best-effort.
    async fn retire_entry(&self, record: &ModuleRecord, dir: &Path) {
        let Some(env_record) = &record.environment else {
            return;
        };
        let manifest = read_manifest(dir).ok();
        let entry_point = manifest.as_ref().map_or("main", Manifest::entry_point);
        match self.provider.open(
            &record.coordinate,
            env_record,
            &dir.join(ENV_DIR),
            &dir.join(CODE_DIR),
            entry_point,
        ) {
            Ok(environment) => {
                if let Err(e) = environment.destroy().await {
                    warn!(coordinate = %record.coordinate, error = %e,
                        "Failed to destroy superseded environment");
                }
            }
            Err(e) => {
                warn!(coordinate = %record.coordinate, error = %e,
                    "Failed to open superseded environment for teardown");
            }
        }
    }

    /// Record a reference module: configuration overrides on top of a
    /// base coordinate, with no code or environment of its own.
    ///
    /// Validation of the base chain (existence, cycles) belongs to the
    /// reference resolver; this is the raw store write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Manifest`] if the override maps conflict, and
    /// I/O errors from the write.
    pub async fn install_reference(
        &self,
        coordinate: &ModuleCoordinate,
        base: &ModuleCoordinate,
        overrides: &ManifestOverrides,
    ) -> StoreResult<InstalledModule> {
        let _lock = SlugLock::acquire(&self.locks_dir(), coordinate.namespace(), coordinate.name())?;

        let manifest = Manifest::from_overrides(coordinate.clone(), overrides)?;
        let live = self.module_dir(coordinate.namespace(), coordinate.name());

        if live.exists() {
            if let Ok(old) = read_record(&live) {
                self.retire_entry(&old, &live).await;
            }
            std::fs::remove_dir_all(&live)?;
        }
        std::fs::create_dir_all(live.join(TRACES_DIR))?;
        std::fs::write(live.join(MANIFEST_FILE_NAME), manifest.to_toml_string()?)?;
        let record = ModuleRecord {
            schema_version: SCHEMA_VERSION,
            coordinate: coordinate.clone(),
            kind: RecordKind::Reference,
            installed_at: Utc::now(),
            digest: None,
            environment: None,
            base: Some(base.clone()),
        };
        write_record(&live, &record)?;

        info!(coordinate = %coordinate, base = %base, "Installed reference module");
        self.read_installed(&live)
    }

    /// Merge configuration overrides into a module's stored manifest.
    ///
    /// Touches neither code nor environment.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotInstalled`] if the name is absent and
    /// [`StoreError::Manifest`] on a conflicting merge.
    pub fn configure(
        &self,
        spec: &str,
        overrides: &ManifestOverrides,
    ) -> StoreResult<InstalledModule> {
        let query = parse_spec(spec)?;
        let _lock = SlugLock::acquire(&self.locks_dir(), query.namespace(), query.name())?;

        let entry = self.lookup(spec)?;
        let merged = entry.manifest.merged(overrides)?;
        std::fs::write(
            entry.module_dir.join(MANIFEST_FILE_NAME),
            merged.to_toml_string()?,
        )?;
        info!(coordinate = %entry.record.coordinate, "Updated module configuration");
        self.read_installed(&entry.module_dir)
    }

    /// Look up an installed entry by name or full coordinate, without
    /// following references.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotInstalled`] when the slug is absent or the
    /// requested version does not match the installed one.
    pub fn lookup(&self, spec: &str) -> StoreResult<InstalledModule> {
        let query = parse_spec(spec)?;
        let module_dir = self.module_dir(query.namespace(), query.name());
        let entry = self
            .read_installed_retry(&module_dir)
            .ok_or_else(|| StoreError::NotInstalled(spec.to_string()))??;
        if let Some(version) = query.version() {
            if entry.record.coordinate.version() != version {
                return Err(StoreError::NotInstalled(spec.to_string()));
            }
        }
        Ok(entry)
    }

    /// Resolve a name to an executable module, following at most one
    /// reference hop.
    ///
    /// Deep reference chains must be resolved iteratively by the caller
    /// (with its own cycle checking); a single-hop landing on another
    /// reference yields [`StoreError::UnresolvedReference`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotInstalled`] for absent names and
    /// [`StoreError::DanglingReference`] when a reference's base is gone.
    pub fn resolve(&self, spec: &str) -> StoreResult<ResolvedModule> {
        let entry = self.lookup(spec)?;
        match entry.record.kind {
            RecordKind::Package => self.resolved_package(&entry, None),
            RecordKind::Reference => {
                let base_coordinate = entry.record.base.clone().ok_or_else(|| {
                    StoreError::CorruptRecord {
                        path: entry.module_dir.join(RECORD_FILE_NAME),
                        message: "reference record without base".to_string(),
                    }
                })?;
                let base = self.lookup(&base_coordinate.slug()).map_err(|e| match e {
                    StoreError::NotInstalled(_) => StoreError::DanglingReference {
                        name: entry.record.coordinate.to_string(),
                        base: base_coordinate.to_string(),
                    },
                    other => other,
                })?;
                if base.is_reference() {
                    return Err(StoreError::UnresolvedReference {
                        name: entry.record.coordinate.to_string(),
                        base: base.record.coordinate.to_string(),
                    });
                }
                let effective = base.manifest.merged(&entry.overrides())?;
                self.resolved_package(&base, Some((entry, effective)))
            }
        }
    }

    /// Resolve a name through an arbitrarily deep reference chain.
    ///
    /// [`ModuleStore::resolve`] is the single-hop primitive; this is the
    /// iterative caller convenience, with a visited-set cycle check
    /// bounded to 32 hops. Override maps merge innermost-first, so the
    /// outermost reference wins.
    ///
    /// # Errors
    ///
    /// As [`ModuleStore::resolve`], plus [`StoreError::ReferenceCycle`]
    /// when the chain revisits a slug or exceeds the hop bound.
    pub fn resolve_deep(&self, spec: &str) -> StoreResult<ResolvedModule> {
        const MAX_HOPS: usize = 32;

        let requested = self.lookup(spec)?;
        let mut visited = vec![requested.record.coordinate.slug()];
        let mut override_stack = Vec::new();
        let mut current = requested.clone();

        for _ in 0..MAX_HOPS {
            match current.record.kind {
                RecordKind::Package => {
                    let mut effective = current.manifest.clone();
                    for overrides in override_stack.iter().rev() {
                        effective = effective.merged(overrides)?;
                    }
                    let through = if requested.record.coordinate == current.record.coordinate {
                        None
                    } else {
                        Some((requested, effective))
                    };
                    return self.resolved_package(&current, through);
                }
                RecordKind::Reference => {
                    override_stack.push(current.overrides());
                    let base = current.record.base.clone().ok_or_else(|| {
                        StoreError::CorruptRecord {
                            path: current.module_dir.join(RECORD_FILE_NAME),
                            message: "reference record without base".to_string(),
                        }
                    })?;
                    let slug = base.slug();
                    if visited.contains(&slug) {
                        return Err(StoreError::ReferenceCycle {
                            name: spec.to_string(),
                            chain: visited,
                        });
                    }
                    visited.push(slug.clone());
                    current = self.lookup(&slug).map_err(|e| match e {
                        StoreError::NotInstalled(_) => StoreError::DanglingReference {
                            name: current.record.coordinate.to_string(),
                            base: base.to_string(),
                        },
                        other => other,
                    })?;
                }
            }
        }
        Err(StoreError::ReferenceCycle {
            name: spec.to_string(),
            chain: visited,
        })
    }

    /// Build a [`ResolvedModule`] from a package entry, optionally viewed
    /// through a reference.
    fn resolved_package(
        &self,
        package: &InstalledModule,
        through: Option<(InstalledModule, Manifest)>,
    ) -> StoreResult<ResolvedModule> {
        let environment = package.record.environment.clone().ok_or_else(|| {
            StoreError::CorruptRecord {
                path: package.module_dir.join(RECORD_FILE_NAME),
                message: "package record without environment".to_string(),
            }
        })?;
        let (coordinate, module_dir, manifest) = match through {
            Some((reference, effective)) => (
                reference.record.coordinate.clone(),
                reference.module_dir,
                effective,
            ),
            None => (
                package.record.coordinate.clone(),
                package.module_dir.clone(),
                package.manifest.clone(),
            ),
        };
        Ok(ResolvedModule {
            coordinate,
            provider: package.record.coordinate.clone(),
            entry_point: package.manifest.entry_point().to_string(),
            code_dir: package.module_dir.join(CODE_DIR),
            env_dir: package.module_dir.join(ENV_DIR),
            environment,
            manifest,
            module_dir,
        })
    }

    /// Open the execution environment of a resolved module.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EnvironmentProvisionFailed`] when the
    /// recorded environment cannot be reopened or was provisioned by a
    /// different provider kind.
    pub fn environment(&self, resolved: &ResolvedModule) -> StoreResult<Box<dyn Environment>> {
        if resolved.environment.provider != self.provider.kind() {
            return Err(StoreError::EnvironmentProvisionFailed {
                coordinate: resolved.provider.to_string(),
                message: format!(
                    "environment was provisioned by '{}' but the store uses '{}'",
                    resolved.environment.provider,
                    self.provider.kind()
                ),
            });
        }
        self.provider.open(
            &resolved.provider,
            &resolved.environment,
            &resolved.env_dir,
            &resolved.code_dir,
            &resolved.entry_point,
        )
    }

    /// Remove an installed entry, destroying its environment.
    ///
    /// References pointing at the removed entry are left in place; they
    /// fail with [`StoreError::DanglingReference`] at their next
    /// resolution.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotInstalled`] when the name is absent.
    pub async fn uninstall(&self, spec: &str) -> StoreResult<()> {
        let query = parse_spec(spec)?;
        let _lock = SlugLock::acquire(&self.locks_dir(), query.namespace(), query.name())?;

        let entry = self.lookup(spec)?;
        self.retire_entry(&entry.record, &entry.module_dir).await;
        std::fs::remove_dir_all(&entry.module_dir)?;
        info!(coordinate = %entry.record.coordinate, "Uninstalled module");
        Ok(())
    }

    /// All installed entries, ordered by coordinate.
    ///
    /// Corrupt entries are skipped with a warning rather than failing the
    /// listing; this is the discovery input for the engine's tool catalog.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from scanning the store.
    pub fn list(&self) -> StoreResult<Vec<InstalledModule>> {
        let mut entries = Vec::new();
        let modules = self.modules_dir();
        for namespace in read_subdirs(&modules)? {
            for module_dir in read_subdirs(&namespace)? {
                match self.read_installed(&module_dir) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        warn!(path = %module_dir.display(), error = %e,
                            "Skipping unreadable store entry");
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.record.coordinate.cmp(&b.record.coordinate));
        Ok(entries)
    }

    /// Read a module entry, retrying once to cover the supersession swap
    /// window. `None` means the slug is not installed.
    fn read_installed_retry(&self, module_dir: &Path) -> Option<StoreResult<InstalledModule>> {
        for _ in 0..2 {
            if module_dir.join(RECORD_FILE_NAME).exists() {
                return Some(self.read_installed(module_dir));
            }
            std::thread::yield_now();
        }
        None
    }

    /// Read the record and effective manifest of one entry.
    fn read_installed(&self, module_dir: &Path) -> StoreResult<InstalledModule> {
        let record = read_record(module_dir)?;
        let manifest = read_manifest(module_dir)?;
        Ok(InstalledModule {
            record,
            manifest,
            module_dir: module_dir.to_path_buf(),
        })
    }
}

impl std::fmt::Debug for ModuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleStore")
            .field("root", &self.root)
            .field("provider", &self.provider.kind())
            .finish()
    }
}

/// Parse a lookup spec (`ns/name` or `ns/name@version`).
fn parse_spec(spec: &str) -> StoreResult<ToolRef> {
    ToolRef::parse(spec).map_err(|_| StoreError::NotInstalled(spec.to_string()))
}

/// Read `record.toml` from a module directory.
fn read_record(module_dir: &Path) -> StoreResult<ModuleRecord> {
    let path = module_dir.join(RECORD_FILE_NAME);
    let raw = std::fs::read_to_string(&path)?;
    toml::from_str(&raw).map_err(|e| StoreError::CorruptRecord {
        path,
        message: e.to_string(),
    })
}

/// Write `record.toml` into a module directory.
fn write_record(module_dir: &Path, record: &ModuleRecord) -> StoreResult<()> {
    let path = module_dir.join(RECORD_FILE_NAME);
    let raw = toml::to_string_pretty(record).map_err(|e| StoreError::CorruptRecord {
        path: path.clone(),
        message: e.to_string(),
    })?;
    std::fs::write(path, raw)?;
    Ok(())
}

/// Read the effective `manifest.toml` from a module directory.
fn read_manifest(module_dir: &Path) -> StoreResult<Manifest> {
    let raw = std::fs::read_to_string(module_dir.join(MANIFEST_FILE_NAME))?;
    Ok(Manifest::parse(&raw)?)
}

/// Subdirectories of `dir`, tolerating a missing directory.
fn read_subdirs(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}
