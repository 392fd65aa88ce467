//! In-process execution environments backed by a step registry.
//!
//! A [`ModuleProgram`] is the explicit form of a module's internal step
//! graph: a tagged map of `name → step function` plus a start-step
//! pointer, populated at load time. The [`NativeRuntime`] holds the
//! programs registered in this process, keyed by module slug, and its
//! provider hands out environments whose `invoke` dispatches directly
//! into the registry. Embedders register their modules here; the
//! integration suites drive the whole engine through it without spawning
//! processes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use tether_core::{InvokeRequest, ModuleCoordinate, Requirement, StepResult};

use crate::env::{Environment, EnvironmentId, EnvironmentProvider, EnvironmentRecord};
use crate::error::{StoreError, StoreResult};

/// Provider kind string for native environments.
pub const NATIVE_PROVIDER_KIND: &str = "native";

/// A step function: one synchronous state transition of a module.
pub type StepFn = Arc<dyn Fn(&InvokeRequest) -> StepResult + Send + Sync>;

/// A module's step graph: named steps plus the start-step pointer.
#[derive(Default)]
pub struct ModuleProgram {
    steps: HashMap<String, StepFn>,
    start_step: Option<String>,
}

impl ModuleProgram {
    /// An empty program.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step function under a name.
    pub fn register_step<F>(&mut self, name: impl Into<String>, step: F)
    where
        F: Fn(&InvokeRequest) -> StepResult + Send + Sync + 'static,
    {
        self.steps.insert(name.into(), Arc::new(step));
    }

    /// Set the step the engine invokes first.
    pub fn set_start_step(&mut self, name: impl Into<String>) {
        self.start_step = Some(name.into());
    }

    /// The start step, if one was set.
    #[must_use]
    pub fn start_step(&self) -> Option<&str> {
        self.start_step.as_deref()
    }

    /// Look up a step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<StepFn> {
        self.steps.get(name).cloned()
    }
}

impl std::fmt::Debug for ModuleProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.steps.keys().collect();
        names.sort();
        f.debug_struct("ModuleProgram")
            .field("steps", &names)
            .field("start_step", &self.start_step)
            .finish()
    }
}

/// The in-process program registry, keyed by module slug.
#[derive(Default)]
pub struct NativeRuntime {
    programs: RwLock<HashMap<String, Arc<ModuleProgram>>>,
}

impl NativeRuntime {
    /// An empty runtime.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or replace) the program for a slug.
    pub fn register(&self, slug: impl Into<String>, program: ModuleProgram) {
        let slug = slug.into();
        debug!(slug = %slug, program = ?program, "Registered native module program");
        self.programs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(slug, Arc::new(program));
    }

    /// Look up the program for a slug.
    #[must_use]
    pub fn program(&self, slug: &str) -> Option<Arc<ModuleProgram>> {
        self.programs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(slug)
            .cloned()
    }
}

/// Environment provider dispatching into a [`NativeRuntime`].
pub struct NativeEnvironmentProvider {
    runtime: Arc<NativeRuntime>,
}

impl NativeEnvironmentProvider {
    /// A provider over the given runtime.
    #[must_use]
    pub fn new(runtime: Arc<NativeRuntime>) -> Self {
        Self { runtime }
    }
}

impl EnvironmentProvider for NativeEnvironmentProvider {
    fn kind(&self) -> &'static str {
        NATIVE_PROVIDER_KIND
    }

    fn provision(
        &self,
        coordinate: &ModuleCoordinate,
        env_dir: &Path,
        _code_dir: &Path,
        _entry_point: &str,
    ) -> StoreResult<Box<dyn Environment>> {
        std::fs::create_dir_all(env_dir).map_err(|e| StoreError::EnvironmentProvisionFailed {
            coordinate: coordinate.to_string(),
            message: e.to_string(),
        })?;
        Ok(Box::new(NativeEnvironment {
            record: EnvironmentRecord {
                id: EnvironmentId::new(),
                provider: NATIVE_PROVIDER_KIND.to_string(),
            },
            slug: coordinate.slug(),
            runtime: Arc::clone(&self.runtime),
        }))
    }

    fn open(
        &self,
        coordinate: &ModuleCoordinate,
        record: &EnvironmentRecord,
        _env_dir: &Path,
        _code_dir: &Path,
        _entry_point: &str,
    ) -> StoreResult<Box<dyn Environment>> {
        Ok(Box::new(NativeEnvironment {
            record: record.clone(),
            slug: coordinate.slug(),
            runtime: Arc::clone(&self.runtime),
        }))
    }
}

/// An environment whose execution unit is a registered in-process program.
struct NativeEnvironment {
    record: EnvironmentRecord,
    slug: String,
    runtime: Arc<NativeRuntime>,
}

impl NativeEnvironment {
    fn require_program(&self) -> StoreResult<Arc<ModuleProgram>> {
        self.runtime
            .program(&self.slug)
            .ok_or_else(|| StoreError::InvokeFailed(format!(
                "no native program registered for {}",
                self.slug
            )))
    }
}

#[async_trait]
impl Environment for NativeEnvironment {
    fn record(&self) -> &EnvironmentRecord {
        &self.record
    }

    fn start_step(&self) -> StoreResult<String> {
        let program = self.require_program()?;
        program
            .start_step()
            .map(str::to_string)
            .ok_or_else(|| {
                StoreError::InvokeFailed(format!("no start step defined for {}", self.slug))
            })
    }

    async fn install_dependencies(&self, _requirements: &[Requirement]) -> StoreResult<()> {
        // The host process already links everything a native program needs.
        Ok(())
    }

    async fn invoke(&self, request: &InvokeRequest, timeout: Duration) -> StoreResult<StepResult> {
        let program = self.require_program()?;
        let step = program.step(&request.step).ok_or_else(|| {
            StoreError::InvokeFailed(format!(
                "step '{}' not found in module {}",
                request.step, self.slug
            ))
        })?;

        // Run on a blocking thread so a long step cannot stall the
        // executor, and so the deadline applies from the outside.
        let request = request.clone();
        let handle = tokio::task::spawn_blocking(move || step(&request));
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(join_error)) => Err(StoreError::InvokeFailed(format!(
                "step panicked: {join_error}"
            ))),
            Err(_) => Err(StoreError::Timeout(timeout)),
        }
    }

    async fn destroy(&self) -> StoreResult<()> {
        Ok(())
    }
}
