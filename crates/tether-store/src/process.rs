//! Process-backed execution environments.
//!
//! Each invocation runs the module's entry point as a child process in its
//! code directory: one JSON [`InvokeRequest`] on stdin, one JSON
//! [`StepResult`] line on stdout (the last non-empty line, so modules may
//! log above it), stderr free for diagnostics. The deadline is enforced by
//! killing the child.
//!
//! Dependency installation pins the verified requirement set into the
//! environment directory (`requirements.toml`); fetching the packages
//! themselves is the opaque external collaborator of the system boundary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use tether_core::{InvokeRequest, ModuleCoordinate, Requirement, StepResult};

use crate::env::{Environment, EnvironmentId, EnvironmentProvider, EnvironmentRecord};
use crate::error::{StoreError, StoreResult};

/// Provider kind string for process environments.
pub const PROCESS_PROVIDER_KIND: &str = "process";

/// Pinned requirement file inside an environment directory.
const REQUIREMENTS_FILE_NAME: &str = "requirements.toml";

/// Conventional start step for process modules; the child's runner maps it
/// to its own registered start step.
const DEFAULT_START_STEP: &str = "main";

/// Environment provider that isolates each invocation in a child process.
#[derive(Debug, Default)]
pub struct ProcessEnvironmentProvider;

impl ProcessEnvironmentProvider {
    /// A new process provider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl EnvironmentProvider for ProcessEnvironmentProvider {
    fn kind(&self) -> &'static str {
        PROCESS_PROVIDER_KIND
    }

    fn provision(
        &self,
        coordinate: &ModuleCoordinate,
        env_dir: &Path,
        code_dir: &Path,
        entry_point: &str,
    ) -> StoreResult<Box<dyn Environment>> {
        std::fs::create_dir_all(env_dir).map_err(|e| StoreError::EnvironmentProvisionFailed {
            coordinate: coordinate.to_string(),
            message: format!("failed to create environment directory: {e}"),
        })?;
        Ok(Box::new(ProcessEnvironment {
            record: EnvironmentRecord {
                id: EnvironmentId::new(),
                provider: PROCESS_PROVIDER_KIND.to_string(),
            },
            coordinate: coordinate.clone(),
            env_dir: env_dir.to_path_buf(),
            code_dir: code_dir.to_path_buf(),
            entry_point: entry_point.to_string(),
        }))
    }

    fn open(
        &self,
        coordinate: &ModuleCoordinate,
        record: &EnvironmentRecord,
        env_dir: &Path,
        code_dir: &Path,
        entry_point: &str,
    ) -> StoreResult<Box<dyn Environment>> {
        if !env_dir.is_dir() {
            return Err(StoreError::EnvironmentProvisionFailed {
                coordinate: coordinate.to_string(),
                message: format!("environment directory missing: {}", env_dir.display()),
            });
        }
        Ok(Box::new(ProcessEnvironment {
            record: record.clone(),
            coordinate: coordinate.clone(),
            env_dir: env_dir.to_path_buf(),
            code_dir: code_dir.to_path_buf(),
            entry_point: entry_point.to_string(),
        }))
    }
}

/// A process-backed environment for one module.
struct ProcessEnvironment {
    record: EnvironmentRecord,
    coordinate: ModuleCoordinate,
    env_dir: PathBuf,
    code_dir: PathBuf,
    entry_point: String,
}

#[async_trait]
impl Environment for ProcessEnvironment {
    fn record(&self) -> &EnvironmentRecord {
        &self.record
    }

    fn start_step(&self) -> StoreResult<String> {
        Ok(DEFAULT_START_STEP.to_string())
    }

    async fn install_dependencies(&self, requirements: &[Requirement]) -> StoreResult<()> {
        let mut pinned: BTreeMap<&str, String> = BTreeMap::new();
        for requirement in requirements {
            let constraint = requirement.constraint.to_string();
            if let Some(existing) = pinned.get(requirement.name.as_str()) {
                if existing != &constraint {
                    return Err(StoreError::DependencyInstallFailed {
                        coordinate: self.coordinate.to_string(),
                        message: format!(
                            "conflicting constraints for '{}': '{existing}' vs '{constraint}'",
                            requirement.name
                        ),
                    });
                }
                continue;
            }
            pinned.insert(&requirement.name, constraint);
        }

        let document = toml::to_string_pretty(
            &[("packages", &pinned)]
                .into_iter()
                .collect::<BTreeMap<_, _>>(),
        )
        .map_err(|e| StoreError::DependencyInstallFailed {
            coordinate: self.coordinate.to_string(),
            message: e.to_string(),
        })?;
        std::fs::write(self.env_dir.join(REQUIREMENTS_FILE_NAME), document).map_err(|e| {
            StoreError::DependencyInstallFailed {
                coordinate: self.coordinate.to_string(),
                message: e.to_string(),
            }
        })?;
        debug!(coordinate = %self.coordinate, count = requirements.len(),
            "Pinned environment requirements");
        Ok(())
    }

    async fn invoke(&self, request: &InvokeRequest, timeout: Duration) -> StoreResult<StepResult> {
        let entry = self.code_dir.join(&self.entry_point);
        if !entry.is_file() {
            return Err(StoreError::InvokeFailed(format!(
                "entry point missing: {}",
                entry.display()
            )));
        }

        let payload = serde_json::to_vec(request)
            .map_err(|e| StoreError::InvokeFailed(format!("unserializable request: {e}")))?;

        let mut child = tokio::process::Command::new(&entry)
            .current_dir(&self.code_dir)
            .env("TETHER_MODULE", self.coordinate.to_string())
            .env("TETHER_ENV_DIR", &self.env_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StoreError::InvokeFailed(format!(
                "failed to spawn {}: {e}",
                entry.display()
            )))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&payload).await {
                // A module that exits without reading its input is
                // reported through its exit status, not the pipe.
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(StoreError::InvokeFailed(format!(
                        "failed to write request: {e}"
                    )));
                }
            }
            // Dropping stdin closes the pipe so the child sees EOF.
        }

        // On deadline the future is dropped and kill_on_drop terminates
        // the child.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                output.map_err(|e| StoreError::InvokeFailed(format!("wait failed: {e}")))?
            }
            Err(_) => {
                warn!(coordinate = %self.coordinate, ?timeout, "Invocation deadline elapsed; child killed");
                return Err(StoreError::Timeout(timeout));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StoreError::InvokeFailed(format!(
                "module process exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| StoreError::InvokeFailed("module produced no result".to_string()))?;
        serde_json::from_str(line.trim())
            .map_err(|e| StoreError::InvokeFailed(format!("unreadable step result: {e}")))
    }

    async fn destroy(&self) -> StoreResult<()> {
        if self.env_dir.is_dir() {
            std::fs::remove_dir_all(&self.env_dir)?;
        }
        Ok(())
    }
}
