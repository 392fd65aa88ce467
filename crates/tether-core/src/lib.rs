//! Tether Core - Foundation types for the Tether module runtime.
//!
//! This crate provides:
//! - Module identity ([`ModuleCoordinate`], [`ToolRef`]) with semantic
//!   versioning
//! - The [`Manifest`] model: static (`configurables`) and run-varying
//!   (`tunables`) configuration, parsing and merging
//! - The cross-sandbox wire types ([`StepResult`], [`InvokeRequest`])
//!   exchanged between the engine and module execution environments

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod coordinate;
pub mod manifest;
pub mod step;

pub use coordinate::{CoordinateParseError, ModuleCoordinate, ToolRef};
pub use manifest::{
    Manifest, ManifestError, ManifestOverrides, ManifestResult, Requirement, MANIFEST_FILE_NAME,
};
pub use step::{ErrorKind, InvokeRequest, StepResult, ToolCatalogEntry};
