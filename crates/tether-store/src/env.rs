//! The isolated execution environment capability.
//!
//! The store and engine never depend on *how* a module is isolated — only
//! on this seam: an [`Environment`] can have dependencies installed into
//! it, can invoke a step under a deadline, and can be destroyed.
//! Implementations are free to use OS processes ([`crate::process`]),
//! in-process step registries ([`crate::native`]), containers, or
//! anything else.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tether_core::{InvokeRequest, ModuleCoordinate, Requirement, StepResult};

use crate::error::StoreResult;

/// Unique identity of a provisioned environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(Uuid);

impl EnvironmentId {
    /// Generate a fresh environment id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EnvironmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The persisted identity of a module's environment.
///
/// The environment's on-disk location is not recorded here: by store
/// layout it is always the `env/` directory inside the owning module's
/// directory, which keeps records valid across the staged install swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    /// The environment's identity.
    pub id: EnvironmentId,
    /// The provider kind that created it (e.g. `process`, `native`).
    pub provider: String,
}

/// A handle to one module's isolated execution environment.
#[async_trait]
pub trait Environment: Send + Sync {
    /// The environment's persisted identity.
    fn record(&self) -> &EnvironmentRecord;

    /// The step the engine should invoke first for this module.
    fn start_step(&self) -> StoreResult<String>;

    /// Install the module's declared dependency requirements.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::DependencyInstallFailed`] when the
    /// requirement list cannot be satisfied.
    async fn install_dependencies(&self, requirements: &[Requirement]) -> StoreResult<()>;

    /// Execute one step invocation under a deadline.
    ///
    /// Exceeding `timeout` forcibly terminates the underlying execution
    /// unit and returns [`crate::StoreError::Timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::InvokeFailed`] when the execution unit
    /// cannot be started or produces an unreadable result.
    async fn invoke(&self, request: &InvokeRequest, timeout: Duration) -> StoreResult<StepResult>;

    /// Tear the environment down, releasing its resources.
    async fn destroy(&self) -> StoreResult<()>;
}

/// Factory for environments; the store owns *when* environments exist,
/// the provider owns *what* they are.
pub trait EnvironmentProvider: Send + Sync {
    /// The provider kind recorded in [`EnvironmentRecord::provider`].
    fn kind(&self) -> &'static str;

    /// Create a fresh environment at `env_dir` for a module whose code
    /// lives at `code_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::EnvironmentProvisionFailed`] when the
    /// environment cannot be created.
    fn provision(
        &self,
        coordinate: &ModuleCoordinate,
        env_dir: &Path,
        code_dir: &Path,
        entry_point: &str,
    ) -> StoreResult<Box<dyn Environment>>;

    /// Open a handle to a previously provisioned environment.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::EnvironmentProvisionFailed`] when the
    /// recorded environment cannot be reopened.
    fn open(
        &self,
        coordinate: &ModuleCoordinate,
        record: &EnvironmentRecord,
        env_dir: &Path,
        code_dir: &Path,
        entry_point: &str,
    ) -> StoreResult<Box<dyn Environment>>;
}
