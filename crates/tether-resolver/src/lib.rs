//! Tether Resolver - turns a project's declared dependency set into store
//! installations, and reference declarations into store entries.
//!
//! This crate provides:
//! - [`ProjectConfig`]: the `.tether/deps.toml` dependency declaration
//! - [`sync`]: idempotent, per-module bulk installation with a
//!   partial-success report
//! - [`RegistryFetcher`]: the opaque remote-fetch seam, with file and
//!   HTTP implementations
//! - [`install_reference`]: cycle-checked installation of reference
//!   modules

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod project;
pub mod reference;
pub mod registry;
pub mod sync;

pub use error::{ResolverError, ResolverResult};
pub use project::{ProjectConfig, SourceOverride, DEPS_FILE_NAME, PROJECT_DIR};
pub use reference::{install_reference, ReferenceDeclaration, MAX_REFERENCE_HOPS};
pub use registry::{registry_from_config, FileRegistry, HttpRegistry, NoRegistry, RegistryFetcher};
pub use sync::{sync, SyncFailure, SyncReport};
