//! Execution trace capture.
//!
//! A trace is an append-only record of one run: ordered step records with
//! input digests, durations, truncated output summaries, and nested
//! sub-traces for tool invocations. It is produced fresh per run and
//! written exactly once — on success or failure — into the invoked
//! module's `traces/` store location. Nested tool traces do not get their
//! own files; they nest inside the parent artifact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use tether_core::ModuleCoordinate;

use crate::error::{EngineError, EngineResult};
use crate::state::RunState;

/// Maximum characters kept in a step's output summary.
const SUMMARY_LIMIT: usize = 240;

/// One recorded step of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// The step that executed.
    pub step: String,
    /// Blake3 digest of the step's input, prefixed `blake3:`.
    pub input_digest: String,
    /// The action tag of the step's result.
    pub action: String,
    /// Truncated rendering of the step's output.
    pub summary: String,
    /// When the step started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Nested sub-trace, present when this step requested a tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<Box<ExecutionTrace>>,
}

/// The recorded sequence of steps and nested tool invocations for one
/// run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    /// Unique id of this run.
    pub trace_id: Uuid,
    /// The invoked module.
    pub coordinate: ModuleCoordinate,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Terminal state of the run.
    pub final_state: RunState,
    /// Ordered step records.
    pub steps: Vec<StepRecord>,
    /// Non-fatal warnings (e.g. declared tools missing from the catalog).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ExecutionTrace {
    /// Begin a trace for a run of `coordinate`.
    #[must_use]
    pub fn begin(coordinate: ModuleCoordinate) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            coordinate,
            started_at: Utc::now(),
            finished_at: None,
            final_state: RunState::Pending,
            steps: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Append a step record.
    pub fn record(&mut self, record: StepRecord) {
        self.steps.push(record);
    }

    /// Append a warning.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Attach a tool sub-trace to the most recent step.
    pub fn attach_sub_trace(&mut self, sub_trace: ExecutionTrace) {
        if let Some(last) = self.steps.last_mut() {
            last.tool = Some(Box::new(sub_trace));
        }
    }

    /// Close the trace with its terminal state.
    pub fn finish(&mut self, state: RunState) {
        self.final_state = state;
        self.finished_at = Some(Utc::now());
    }

    /// Artifact file name: `trace_<id>_<YYYYMMDD_HHMMSS>.json`.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "trace_{}_{}.json",
            self.trace_id,
            self.started_at.format("%Y%m%d_%H%M%S")
        )
    }

    /// Write the artifact into `dir`, returning the written path.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TraceWrite`] when the artifact cannot be
    /// serialized or written.
    pub fn write_to(&self, dir: &Path) -> EngineResult<PathBuf> {
        let path = dir.join(self.file_name());
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(dir)?;
            let json = serde_json::to_vec_pretty(self)?;
            std::fs::write(&path, json)
        };
        write().map_err(|e| EngineError::TraceWrite {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Ok(path)
    }
}

/// Blake3 digest of a step input, prefixed `blake3:`, truncated to
/// 16 hex characters — enough to correlate, short enough to read.
#[must_use]
pub fn input_digest(input: &Value) -> String {
    let rendered = input.to_string();
    let hex = blake3::hash(rendered.as_bytes()).to_hex();
    format!("blake3:{}", &hex.as_str()[..16])
}

/// Truncate an output rendering for the trace summary.
#[must_use]
pub fn summarize(output: &str) -> String {
    if output.len() <= SUMMARY_LIMIT {
        return output.to_string();
    }
    let mut cut = SUMMARY_LIMIT;
    while !output.is_char_boundary(cut) {
        cut = cut.saturating_sub(1);
    }
    format!("{}…", &output[..cut])
}
