//! The execution engine.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use tether_core::{ErrorKind, InvokeRequest, ManifestOverrides, StepResult, ToolRef};
use tether_store::{Environment as _, ModuleStore, StoreError};

use crate::catalog::{build_catalog, is_declared};
use crate::error::EngineResult;
use crate::state::RunState;
use crate::trace::{input_digest, summarize, ExecutionTrace, StepRecord};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Deadline for one run, shared with all nested tool invocations.
    pub timeout: Duration,
    /// Per-tool-call deadline, capped by the run deadline. Keeping it
    /// below the run timeout is what lets a parent survive a tool timeout
    /// with budget left to act on the error observation.
    pub tool_timeout: Duration,
    /// Maximum tool round trips per run before failing with
    /// `tool_loop_limit`.
    pub max_tool_iterations: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(30),
            max_tool_iterations: 5,
        }
    }
}

/// The result of one engine run: the terminal step result plus the trace.
#[derive(Debug)]
pub struct RunOutcome {
    /// Terminal `response` or `error` result.
    pub result: StepResult,
    /// The full trace, including nested tool sub-traces.
    pub trace: ExecutionTrace,
    /// Where the trace artifact was written, when the write succeeded.
    pub trace_path: Option<PathBuf>,
}

/// Outcome of a (possibly nested) run before trace persistence.
struct InnerOutcome {
    result: StepResult,
    trace: ExecutionTrace,
    traces_dir: PathBuf,
}

/// Runs installed modules as step state machines with recursive tool
/// dispatch.
#[derive(Debug)]
pub struct Engine {
    store: Arc<ModuleStore>,
    options: EngineOptions,
}

impl Engine {
    /// An engine over `store` with default options.
    #[must_use]
    pub fn new(store: Arc<ModuleStore>) -> Self {
        Self::with_options(store, EngineOptions::default())
    }

    /// An engine over `store` with explicit options.
    #[must_use]
    pub fn with_options(store: Arc<ModuleStore>, options: EngineOptions) -> Self {
        Self { store, options }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<ModuleStore> {
        &self.store
    }

    /// Run `target` against `input`, with optional run-time configuration
    /// overrides that never touch the store.
    ///
    /// A module's own failure is a terminal `error`-kind result inside
    /// the returned [`RunOutcome`], not an `Err`: only framework faults
    /// (an unresolvable target, an unopenable environment) error out.
    /// The trace artifact is written once into the target module's store
    /// location, on success and failure alike.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError::Store`] when the target cannot be
    /// resolved or its environment opened.
    pub async fn run(
        &self,
        target: &str,
        input: Value,
        overrides: Option<&ManifestOverrides>,
    ) -> EngineResult<RunOutcome> {
        let deadline = Instant::now() + self.options.timeout;
        let inner = self.run_inner(target, input, overrides, deadline).await?;

        let trace_path = match inner.trace.write_to(&inner.traces_dir) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(coordinate = %inner.trace.coordinate, error = %e,
                    "Failed to persist execution trace");
                None
            }
        };
        info!(
            coordinate = %inner.trace.coordinate,
            state = ?inner.trace.final_state,
            steps = inner.trace.steps.len(),
            "Run finished"
        );
        Ok(RunOutcome {
            result: inner.result,
            trace: inner.trace,
            trace_path,
        })
    }

    /// Boxed recursion point for tool dispatch.
    fn run_boxed<'a>(
        &'a self,
        target: &'a str,
        input: Value,
        deadline: Instant,
    ) -> Pin<Box<dyn Future<Output = EngineResult<InnerOutcome>> + Send + 'a>> {
        Box::pin(self.run_inner(target, input, None, deadline))
    }

    /// One module run under a deadline.
    #[allow(clippy::too_many_lines)]
    async fn run_inner(
        &self,
        target: &str,
        input: Value,
        overrides: Option<&ManifestOverrides>,
        deadline: Instant,
    ) -> EngineResult<InnerOutcome> {
        let resolved = self.store.resolve_deep(target)?;
        let mut manifest = resolved.manifest.clone();
        if let Some(overrides) = overrides {
            manifest = manifest.merged(overrides)?;
        }

        let mut trace = ExecutionTrace::begin(resolved.coordinate.clone());

        // Tool discovery: only modules that declare tools pay for the
        // store listing.
        let tool_refs = manifest.tool_list();
        let catalog = if tool_refs.is_empty() {
            Vec::new()
        } else {
            let (catalog, warnings) = build_catalog(&tool_refs, &self.store.list()?);
            for warning in warnings {
                warn!(coordinate = %resolved.coordinate, "{warning}");
                trace.warn(warning);
            }
            catalog
        };

        let environment = self.store.environment(&resolved)?;
        let mut state = RunState::Pending;
        let mut step_name = environment.start_step()?;
        let mut step_input = input;
        let mut observation: Option<String> = None;
        let mut iterations = 0usize;

        debug!(coordinate = %resolved.coordinate, provider = %resolved.provider,
            start_step = %step_name, "Starting run");

        let result = loop {
            state = advance(state, RunState::Running);

            let request = InvokeRequest {
                step: step_name.clone(),
                input: step_input.clone(),
                observation: observation.take(),
                tunables: manifest.tunables().clone(),
                configurables: manifest.configurables().clone(),
                catalog: catalog.clone(),
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state = advance(state, RunState::Failed);
                break StepResult::error(ErrorKind::Timeout, "run deadline exhausted");
            }

            let started_at = Utc::now();
            let begun = Instant::now();
            let invoked = environment.invoke(&request, remaining).await;
            let duration_ms = u64::try_from(begun.elapsed().as_millis()).unwrap_or(u64::MAX);

            let step_result = match invoked {
                Ok(result) => result,
                Err(StoreError::Timeout(elapsed)) => StepResult::error(
                    ErrorKind::Timeout,
                    format!("step '{}' timed out after {elapsed:?}", request.step),
                ),
                Err(StoreError::InvokeFailed(message)) => {
                    StepResult::error(ErrorKind::Module, message)
                }
                Err(other) => return Err(other.into()),
            };

            trace.record(StepRecord {
                step: request.step.clone(),
                input_digest: input_digest(&request.input),
                action: step_result.action().to_string(),
                summary: summarize(&render_result(&step_result)),
                started_at,
                duration_ms,
                tool: None,
            });

            match step_result {
                StepResult::Response { .. } => {
                    state = advance(state, RunState::Completed);
                    break step_result;
                }
                StepResult::Error { .. } => {
                    state = advance(state, RunState::Failed);
                    break step_result;
                }
                StepResult::ToolCall {
                    tool,
                    input: tool_input,
                    state: accumulated,
                    resume_step,
                } => {
                    iterations = iterations.saturating_add(1);
                    if iterations > self.options.max_tool_iterations {
                        state = advance(state, RunState::Failed);
                        break StepResult::error(
                            ErrorKind::ToolLoopLimit,
                            format!(
                                "exceeded {} tool round trips",
                                self.options.max_tool_iterations
                            ),
                        );
                    }

                    let requested = match ToolRef::parse(&tool) {
                        Ok(requested) => requested,
                        Err(e) => {
                            state = advance(state, RunState::Failed);
                            break StepResult::error(
                                ErrorKind::ToolNotDeclared,
                                format!("unparseable tool reference '{tool}': {e}"),
                            );
                        }
                    };
                    if !is_declared(&requested, &tool_refs) {
                        state = advance(state, RunState::Failed);
                        break StepResult::error(
                            ErrorKind::ToolNotDeclared,
                            format!("tool {requested} is not declared in tool_list"),
                        );
                    }
                    if !catalog
                        .iter()
                        .any(|entry| requested.matches(&entry.coordinate))
                    {
                        state = advance(state, RunState::Failed);
                        break StepResult::error(
                            ErrorKind::ToolNotDeclared,
                            format!("tool {requested} is declared but not installed"),
                        );
                    }

                    state = advance(state, RunState::AwaitingTool);
                    debug!(coordinate = %resolved.coordinate, tool = %requested,
                        iteration = iterations, "Dispatching tool call");

                    // A tool failure — including a timeout — is an
                    // ordinary observation to the caller, never a parent
                    // failure.
                    let tool_deadline =
                        deadline.min(Instant::now() + self.options.tool_timeout);
                    let observation_text =
                        match self.run_boxed(&tool, tool_input, tool_deadline).await {
                            Ok(sub) => {
                                let rendered = render_result(&sub.result);
                                trace.attach_sub_trace(sub.trace);
                                rendered
                            }
                            Err(e) => {
                                warn!(coordinate = %resolved.coordinate, tool = %requested,
                                    error = %e, "Tool invocation failed");
                                format!("error(module): tool invocation failed: {e}")
                            }
                        };

                    if let Some(next) = resume_step {
                        step_name = next;
                    }
                    step_input = accumulated;
                    observation = Some(observation_text);
                }
            }
        };

        trace.finish(state);
        Ok(InnerOutcome {
            result,
            trace,
            traces_dir: resolved.module_dir.join("traces"),
        })
    }
}

/// Advance the run-state machine.
fn advance(from: RunState, to: RunState) -> RunState {
    debug_assert!(
        from == to || from.can_transition(to),
        "illegal run-state transition {from:?} -> {to:?}"
    );
    to
}

/// Render a terminal step result as an observation / summary string.
fn render_result(result: &StepResult) -> String {
    match result {
        StepResult::Response { content } => match content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        StepResult::Error { kind, message } => format!("error({kind}): {message}"),
        StepResult::ToolCall { tool, .. } => format!("tool_call: {tool}"),
    }
}
