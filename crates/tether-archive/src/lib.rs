//! Tether Archive - packaging of module source directories into immutable,
//! content-addressable bundles.
//!
//! A package archive is a gzip-compressed tar holding the module's
//! manifest and its code payload. Packing is deterministic: identical
//! inputs produce identical archive bytes, so integrity checking is a
//! blake3 re-hash. Unpacking is hardened against hostile archives
//! (path traversal, unsafe entry types, decompression bombs).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod archive;
pub mod error;

pub use archive::{PackageArchive, ARCHIVE_EXTENSION};
pub use error::{ArchiveError, ArchiveResult};
