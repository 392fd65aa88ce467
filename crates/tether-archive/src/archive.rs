//! Package archive creation, reading, and hardened extraction.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;
use walkdir::WalkDir;

use tether_core::{Manifest, MANIFEST_FILE_NAME};

use crate::error::{ArchiveError, ArchiveResult};

/// File extension of a packaged module.
pub const ARCHIVE_EXTENSION: &str = "tether";

/// Archive-internal directory holding the code payload.
const PAYLOAD_PREFIX: &str = "payload";

/// Maximum number of entries allowed in an archive.
const MAX_ENTRY_COUNT: usize = 10_000;

/// Maximum total extracted size (500 MB) — gzip bomb protection.
const MAX_EXTRACTED_SIZE: u64 = 500_000_000;

/// An immutable, content-addressable module bundle.
///
/// Produced once by [`PackageArchive::pack`] and never mutated. The
/// payload is an opaque blob from the store's and resolver's perspective:
/// it is unpacked to disk but never interpreted.
#[derive(Debug, Clone)]
pub struct PackageArchive {
    manifest: Manifest,
    bytes: Vec<u8>,
    digest: String,
}

impl PackageArchive {
    /// Package a module source directory.
    ///
    /// Reads `module.toml`, validates the declared entry point exists, and
    /// bundles the manifest plus every non-hidden regular file as the
    /// payload. Entries are sorted and headers normalised (zero mtime,
    /// fixed mode and ownership), so identical inputs yield identical
    /// archive bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::MissingManifest`] or
    /// [`ArchiveError::MissingEntryPoint`] when required files are absent,
    /// [`ArchiveError::Manifest`] on a malformed manifest.
    pub fn pack(source_dir: &Path) -> ArchiveResult<Self> {
        let manifest_path = source_dir.join(MANIFEST_FILE_NAME);
        if !manifest_path.is_file() {
            return Err(ArchiveError::MissingManifest(source_dir.to_path_buf()));
        }
        let manifest_raw = std::fs::read(&manifest_path)?;
        let manifest = Manifest::parse(&String::from_utf8_lossy(&manifest_raw))?;

        if !source_dir.join(manifest.entry_point()).is_file() {
            return Err(ArchiveError::MissingEntryPoint {
                entry_point: manifest.entry_point().to_string(),
                source_dir: source_dir.to_path_buf(),
            });
        }

        let mut payload_paths = collect_payload_paths(source_dir)?;
        payload_paths.sort();

        let mut builder = tar::Builder::new(Vec::new());
        append_entry(&mut builder, MANIFEST_FILE_NAME, &manifest_raw)?;
        for relative in &payload_paths {
            let data = std::fs::read(source_dir.join(relative))?;
            let entry_name = format!("{PAYLOAD_PREFIX}/{relative}");
            append_entry(&mut builder, &entry_name, &data)?;
        }
        let tar_bytes = builder
            .into_inner()
            .map_err(|e| ArchiveError::CorruptArchive(format!("failed to finalize tar: {e}")))?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes)?;
        let bytes = encoder.finish()?;
        let digest = blake3::hash(&bytes).to_hex().to_string();

        debug!(
            coordinate = %manifest.coordinate(),
            files = payload_paths.len(),
            digest = %digest,
            "Packed module archive"
        );

        Ok(Self {
            manifest,
            bytes,
            digest,
        })
    }

    /// Read an archive from raw bytes, validating its structure.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::CorruptArchive`] when the manifest entry is
    /// missing, the declared entry point is absent from the payload, or
    /// the bytes do not decompress.
    pub fn from_bytes(bytes: Vec<u8>) -> ArchiveResult<Self> {
        let mut manifest_raw: Option<String> = None;
        let mut payload_paths: Vec<String> = Vec::new();

        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let entries = archive
            .entries()
            .map_err(|e| ArchiveError::CorruptArchive(format!("unreadable archive: {e}")))?;
        for entry in entries {
            let mut entry =
                entry.map_err(|e| ArchiveError::CorruptArchive(format!("bad entry: {e}")))?;
            let path = entry
                .path()
                .map_err(|e| ArchiveError::CorruptArchive(format!("bad entry path: {e}")))?
                .into_owned();
            let name = path.to_string_lossy().into_owned();
            if name == MANIFEST_FILE_NAME {
                let mut raw = String::new();
                entry
                    .read_to_string(&mut raw)
                    .map_err(|e| ArchiveError::CorruptArchive(format!("bad manifest: {e}")))?;
                manifest_raw = Some(raw);
            } else if let Some(stripped) = name.strip_prefix("payload/") {
                payload_paths.push(stripped.to_string());
            }
        }

        let manifest_raw = manifest_raw.ok_or_else(|| {
            ArchiveError::CorruptArchive("no manifest entry in archive".to_string())
        })?;
        let manifest = Manifest::parse(&manifest_raw)?;

        if !payload_paths
            .iter()
            .any(|p| p == manifest.entry_point())
        {
            return Err(ArchiveError::CorruptArchive(format!(
                "declared entry point '{}' absent from payload",
                manifest.entry_point()
            )));
        }

        let digest = blake3::hash(&bytes).to_hex().to_string();
        Ok(Self {
            manifest,
            bytes,
            digest,
        })
    }

    /// Read an archive from a `.tether` file.
    ///
    /// # Errors
    ///
    /// See [`PackageArchive::from_bytes`]; additionally I/O errors from
    /// reading the file.
    pub fn read_from(path: &Path) -> ArchiveResult<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// The embedded manifest, as packaged.
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The raw archive bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Blake3 hex digest of the archive bytes — the content address.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Canonical archive file name: `<ns>_<name>-<version>.tether`.
    #[must_use]
    pub fn file_name(&self) -> String {
        let coordinate = self.manifest.coordinate();
        format!(
            "{}_{}-{}.{ARCHIVE_EXTENSION}",
            coordinate.namespace(),
            coordinate.name(),
            coordinate.version()
        )
    }

    /// Write the archive into `dir` under its canonical file name,
    /// returning the written path.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from the write.
    pub fn write_to(&self, dir: &Path) -> ArchiveResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, &self.bytes)?;
        Ok(path)
    }

    /// Extract the manifest and code payload into `dest`.
    ///
    /// The payload prefix is stripped, so the code lands directly in
    /// `dest` next to `module.toml`.
    ///
    /// # Security
    ///
    /// Rejects `..` components, absolute paths, unsafe entry types
    /// (symlinks, devices), and archives exceeding the entry-count or
    /// total-size caps.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::CorruptArchive`],
    /// [`ArchiveError::PathTraversal`], or
    /// [`ArchiveError::UnsafeEntryType`] on a hostile or damaged archive.
    pub fn unpack(&self, dest: &Path) -> ArchiveResult<()> {
        std::fs::create_dir_all(dest)?;

        let mut archive = tar::Archive::new(GzDecoder::new(self.bytes.as_slice()));
        let entries = archive
            .entries()
            .map_err(|e| ArchiveError::CorruptArchive(format!("unreadable archive: {e}")))?;

        let mut entry_count = 0usize;
        let mut total_size = 0u64;
        for entry in entries {
            let mut entry =
                entry.map_err(|e| ArchiveError::CorruptArchive(format!("bad entry: {e}")))?;

            entry_count = entry_count.saturating_add(1);
            if entry_count > MAX_ENTRY_COUNT {
                return Err(ArchiveError::CorruptArchive(format!(
                    "archive exceeds maximum entry count ({MAX_ENTRY_COUNT})"
                )));
            }

            let entry_type = entry.header().entry_type();
            if !is_safe_entry_type(entry_type) {
                let path = entry
                    .path()
                    .map_or_else(|_| "<unknown>".to_string(), |p| p.display().to_string());
                return Err(ArchiveError::UnsafeEntryType {
                    entry_type: format!("{entry_type:?}"),
                    path,
                });
            }

            let size = entry
                .header()
                .size()
                .map_err(|e| ArchiveError::CorruptArchive(format!("bad entry size: {e}")))?;
            total_size = total_size.saturating_add(size);
            if total_size > MAX_EXTRACTED_SIZE {
                return Err(ArchiveError::CorruptArchive(format!(
                    "archive exceeds maximum extracted size ({MAX_EXTRACTED_SIZE} bytes)"
                )));
            }

            let entry_path = entry
                .path()
                .map_err(|e| ArchiveError::CorruptArchive(format!("bad entry path: {e}")))?
                .into_owned();
            validate_entry_path(&entry_path)?;

            let relative = strip_payload_prefix(&entry_path);
            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&target).map_err(|e| {
                ArchiveError::CorruptArchive(format!(
                    "failed to unpack {}: {e}",
                    entry_path.display()
                ))
            })?;
        }

        // Structural re-validation after extraction.
        if !dest.join(MANIFEST_FILE_NAME).is_file() {
            return Err(ArchiveError::CorruptArchive(
                "no manifest entry in archive".to_string(),
            ));
        }
        if !dest.join(self.manifest.entry_point()).is_file() {
            return Err(ArchiveError::CorruptArchive(format!(
                "declared entry point '{}' absent from payload",
                self.manifest.entry_point()
            )));
        }
        Ok(())
    }
}

/// Relative paths of every payload file under `source_dir`.
///
/// Skips the manifest itself and anything hidden (a path component
/// starting with `.`), which keeps VCS metadata and editor droppings out
/// of the archive.
fn collect_payload_paths(source_dir: &Path) -> ArchiveResult<Vec<String>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(source_dir).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            ArchiveError::CorruptArchive(format!("failed to walk source directory: {e}"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| ArchiveError::CorruptArchive(e.to_string()))?;
        if relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            continue;
        }
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if name == MANIFEST_FILE_NAME {
            continue;
        }
        paths.push(name);
    }
    Ok(paths)
}

/// Append one file entry with a fully normalised header.
fn append_entry(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &str,
    data: &[u8],
) -> ArchiveResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(data.len() as u64);
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| ArchiveError::CorruptArchive(format!("failed to append '{name}': {e}")))?;
    Ok(())
}

/// Check whether a tar entry type is safe to extract.
///
/// Allows regular files, directories, and metadata headers. Rejects
/// symlinks, hardlinks, devices, FIFOs, and sparse entries.
fn is_safe_entry_type(entry_type: tar::EntryType) -> bool {
    matches!(
        entry_type,
        tar::EntryType::Regular
            | tar::EntryType::Directory
            | tar::EntryType::GNULongName
            | tar::EntryType::XHeader
            | tar::EntryType::XGlobalHeader
    )
}

/// Validate that an entry path has no traversal components or absolute
/// paths.
fn validate_entry_path(path: &Path) -> ArchiveResult<()> {
    if path.is_absolute() {
        return Err(ArchiveError::PathTraversal {
            path: path.display().to_string(),
        });
    }
    for component in path.components() {
        if matches!(
            component,
            Component::ParentDir | Component::Prefix(_) | Component::RootDir
        ) {
            return Err(ArchiveError::PathTraversal {
                path: path.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Strip the archive-internal `payload/` prefix.
fn strip_payload_prefix(path: &Path) -> PathBuf {
    let mut components = path.components();
    if let Some(first) = components.next() {
        if first.as_os_str().to_string_lossy() == PAYLOAD_PREFIX {
            return components.as_path().to_path_buf();
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
["ns/calc@0.1.0"]
description = "Evaluates arithmetic expressions."
entry_point = "calc"
"#;

    /// Lay out a minimal module source directory.
    fn module_dir(dir: &Path) {
        std::fs::write(dir.join(MANIFEST_FILE_NAME), MANIFEST).unwrap();
        std::fs::write(dir.join("calc"), b"#!/bin/sh\necho hi\n").unwrap();
        std::fs::create_dir_all(dir.join("lib")).unwrap();
        std::fs::write(dir.join("lib/tables.json"), b"{}").unwrap();
    }

    #[test]
    fn pack_and_unpack_round_trip() {
        let src = tempfile::tempdir().unwrap();
        module_dir(src.path());

        let archive = PackageArchive::pack(src.path()).unwrap();
        assert_eq!(archive.manifest().coordinate().to_string(), "ns/calc@0.1.0");

        let dest = tempfile::tempdir().unwrap();
        archive.unpack(dest.path()).unwrap();
        assert!(dest.path().join(MANIFEST_FILE_NAME).is_file());
        assert!(dest.path().join("calc").is_file());
        assert_eq!(
            std::fs::read(dest.path().join("lib/tables.json")).unwrap(),
            b"{}"
        );
    }

    #[test]
    fn pack_is_deterministic() {
        let src = tempfile::tempdir().unwrap();
        module_dir(src.path());

        let first = PackageArchive::pack(src.path()).unwrap();
        let second = PackageArchive::pack(src.path()).unwrap();
        assert_eq!(first.bytes(), second.bytes());
        assert_eq!(first.digest(), second.digest());
    }

    #[test]
    fn pack_skips_hidden_files() {
        let src = tempfile::tempdir().unwrap();
        module_dir(src.path());
        std::fs::create_dir_all(src.path().join(".git")).unwrap();
        std::fs::write(src.path().join(".git/HEAD"), b"ref").unwrap();
        std::fs::write(src.path().join(".env"), b"SECRET=1").unwrap();

        let archive = PackageArchive::pack(src.path()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        archive.unpack(dest.path()).unwrap();
        assert!(!dest.path().join(".git").exists());
        assert!(!dest.path().join(".env").exists());
    }

    #[test]
    fn pack_missing_manifest() {
        let src = tempfile::tempdir().unwrap();
        assert!(matches!(
            PackageArchive::pack(src.path()),
            Err(ArchiveError::MissingManifest(_))
        ));
    }

    #[test]
    fn pack_missing_entry_point() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join(MANIFEST_FILE_NAME), MANIFEST).unwrap();
        assert!(matches!(
            PackageArchive::pack(src.path()),
            Err(ArchiveError::MissingEntryPoint { entry_point, .. }) if entry_point == "calc"
        ));
    }

    #[test]
    fn from_bytes_round_trip_preserves_digest() {
        let src = tempfile::tempdir().unwrap();
        module_dir(src.path());

        let archive = PackageArchive::pack(src.path()).unwrap();
        let reread = PackageArchive::from_bytes(archive.bytes().to_vec()).unwrap();
        assert_eq!(reread.digest(), archive.digest());
        assert_eq!(
            reread.manifest().coordinate(),
            archive.manifest().coordinate()
        );
    }

    #[test]
    fn from_bytes_rejects_garbage() {
        assert!(matches!(
            PackageArchive::from_bytes(b"not an archive".to_vec()),
            Err(ArchiveError::CorruptArchive(_))
        ));
    }

    #[test]
    fn write_to_uses_canonical_name() {
        let src = tempfile::tempdir().unwrap();
        module_dir(src.path());
        let archive = PackageArchive::pack(src.path()).unwrap();

        let out = tempfile::tempdir().unwrap();
        let path = archive.write_to(out.path()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "ns_calc-0.1.0.tether"
        );

        let reread = PackageArchive::read_from(&path).unwrap();
        assert_eq!(reread.digest(), archive.digest());
    }

    /// Build a raw tar entry header for hostile-path tests; the tar
    /// builder API validates paths, so the bytes are crafted directly.
    fn raw_entry(path_bytes: &[u8], data: &[u8]) -> Vec<u8> {
        let mut header = [0u8; 512];
        let len = path_bytes.len().min(100);
        header[..len].copy_from_slice(&path_bytes[..len]);
        header[100..108].copy_from_slice(b"0000644\0");
        let size_str = format!("{:011o}\0", data.len());
        header[124..136].copy_from_slice(size_str.as_bytes());
        header[156] = b'0';
        header[148..156].copy_from_slice(b"        ");
        let cksum: u32 = header.iter().map(|&b| u32::from(b)).sum();
        let cksum_str = format!("{cksum:06o}\0 ");
        header[148..156].copy_from_slice(cksum_str.as_bytes());

        let mut out = Vec::new();
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        let padding = (512 - (data.len() % 512)) % 512;
        out.extend(std::iter::repeat_n(0u8, padding));
        out
    }

    /// A gzip tar with a valid manifest entry plus one hostile entry.
    fn hostile_archive(evil_path: &[u8]) -> Vec<u8> {
        let mut tar_data = raw_entry(MANIFEST_FILE_NAME.as_bytes(), MANIFEST.as_bytes());
        tar_data.extend(raw_entry(b"payload/calc", b"code"));
        tar_data.extend(raw_entry(evil_path, b"malicious"));
        tar_data.extend(std::iter::repeat_n(0u8, 1024));

        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&tar_data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn unpack_rejects_path_traversal() {
        let archive =
            PackageArchive::from_bytes(hostile_archive(b"payload/../../escape")).unwrap();
        let dest = tempfile::tempdir().unwrap();
        assert!(matches!(
            archive.unpack(dest.path()),
            Err(ArchiveError::PathTraversal { .. })
        ));
    }

    #[test]
    fn unpack_rejects_absolute_path() {
        let archive = PackageArchive::from_bytes(hostile_archive(b"/etc/passwd")).unwrap();
        let dest = tempfile::tempdir().unwrap();
        assert!(matches!(
            archive.unpack(dest.path()),
            Err(ArchiveError::PathTraversal { .. })
        ));
    }

    #[test]
    fn from_bytes_rejects_missing_entry_point_in_payload() {
        // Manifest declares "calc" but the payload only ships "other".
        let mut tar_data = raw_entry(MANIFEST_FILE_NAME.as_bytes(), MANIFEST.as_bytes());
        tar_data.extend(raw_entry(b"payload/other", b"code"));
        tar_data.extend(std::iter::repeat_n(0u8, 1024));
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&tar_data).unwrap();
        let bytes = encoder.finish().unwrap();

        assert!(matches!(
            PackageArchive::from_bytes(bytes),
            Err(ArchiveError::CorruptArchive(message)) if message.contains("entry point")
        ));
    }
}
