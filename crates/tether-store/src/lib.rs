//! Tether Store - the on-disk registry of installed modules and the
//! isolated execution environments they own.
//!
//! This crate provides:
//! - [`ModuleStore`]: install/configure/resolve/uninstall/list with
//!   staged, atomic supersession and per-slug locking
//! - The [`Environment`] capability trait — the seam between the runtime
//!   and whatever isolates a module's execution
//! - [`process`]: child-process environments speaking JSON over stdio
//! - [`native`]: in-process step-registry environments for embedders and
//!   tests

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod error;
pub mod lock;
pub mod native;
pub mod process;
pub mod record;
pub mod store;

pub use env::{Environment, EnvironmentId, EnvironmentProvider, EnvironmentRecord};
pub use error::{StoreError, StoreResult};
pub use native::{ModuleProgram, NativeEnvironmentProvider, NativeRuntime, StepFn};
pub use process::ProcessEnvironmentProvider;
pub use record::{InstalledModule, ModuleRecord, RecordKind, ResolvedModule};
pub use store::ModuleStore;
