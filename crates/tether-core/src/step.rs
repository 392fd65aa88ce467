//! Step results and the cross-sandbox invocation wire types.
//!
//! A module run is a loop of step invocations. Each invocation crosses the
//! sandbox boundary as one [`InvokeRequest`] and comes back as one
//! [`StepResult`]. Keeping the exchange as explicit serialized messages —
//! rather than direct calls — is what lets an execution environment be an
//! OS process, an in-process program, or anything else behind the
//! `Environment` trait.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coordinate::ModuleCoordinate;

/// Classification of an `error` step result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An ordinary error reported by the module itself.
    #[default]
    Module,
    /// The invocation deadline elapsed and the execution unit was
    /// terminated.
    Timeout,
    /// The module requested a tool absent from its declared `tool_list`.
    ToolNotDeclared,
    /// The tool round-trip iteration limit was exceeded.
    ToolLoopLimit,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Module => "module",
            Self::Timeout => "timeout",
            Self::ToolNotDeclared => "tool_not_declared",
            Self::ToolLoopLimit => "tool_loop_limit",
        };
        f.write_str(s)
    }
}

/// The unit a module step returns.
///
/// `response` and `error` are terminal; `tool_call` requests the
/// invocation of another installed module and resumes afterwards with the
/// tool's outcome as an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepResult {
    /// Terminal success.
    Response {
        /// The module's answer.
        content: Value,
    },
    /// Terminal failure.
    Error {
        /// Failure classification.
        #[serde(default)]
        kind: ErrorKind,
        /// Human-readable message.
        message: String,
    },
    /// Non-terminal request to invoke another module as a tool.
    ToolCall {
        /// The requested tool, as a tool-reference string
        /// (`ns/name` or `ns/name:version`).
        tool: String,
        /// Input payload for the tool.
        input: Value,
        /// Opaque accumulated state, fed back to the resuming step.
        #[serde(default)]
        state: Value,
        /// Step that consumes the observation; defaults to the step that
        /// emitted the call.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_step: Option<String>,
    },
}

impl StepResult {
    /// A terminal `response` with the given content.
    #[must_use]
    pub fn response(content: impl Into<Value>) -> Self {
        Self::Response {
            content: content.into(),
        }
    }

    /// A terminal `error` of the given kind.
    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    /// Whether this result ends the run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::ToolCall { .. })
    }

    /// The wire tag of this result's action.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
            Self::ToolCall { .. } => "tool_call",
        }
    }
}

/// One entry of the tool discovery catalog exposed to a module's steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCatalogEntry {
    /// The installed tool's coordinate.
    pub coordinate: ModuleCoordinate,
    /// Short description from the tool's manifest.
    #[serde(default)]
    pub description: String,
    /// Long-form description from the tool's manifest.
    #[serde(default)]
    pub long_description: String,
}

/// One step invocation crossing the sandbox boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// The step to execute.
    pub step: String,
    /// Input payload: the caller's input on the first invocation, the
    /// accumulated `state` of the preceding `tool_call` on resumes.
    pub input: Value,
    /// Rendered outcome of the preceding tool call, if resuming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    /// Effective run-varying configuration.
    #[serde(default)]
    pub tunables: BTreeMap<String, Value>,
    /// Effective static configuration.
    #[serde(default)]
    pub configurables: BTreeMap<String, Value>,
    /// Discovery catalog for the module's declared tools.
    #[serde(default)]
    pub catalog: Vec<ToolCatalogEntry>,
}

impl InvokeRequest {
    /// A request for `step` carrying `input` and no configuration.
    #[must_use]
    pub fn new(step: impl Into<String>, input: Value) -> Self {
        Self {
            step: step.into(),
            input,
            observation: None,
            tunables: BTreeMap::new(),
            configurables: BTreeMap::new(),
            catalog: Vec::new(),
        }
    }
}
