//! Shared types, errors, run state, and execution records for the flowgraph engine.
//!
//! This crate provides the foundational types used across the other flowgraph crates:
//! - `FlowError`: unified error taxonomy
//! - `RunState`: the key-value mapping threaded through one run
//! - `ExecutionLog`: one entry per executed node
//! - `ExecutionResult`: the persisted run record

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unified error type for all flowgraph subsystems.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    // === Configuration Errors ===
    #[error("Graph validation failed: {0}")]
    ValidationError(String),

    #[error("Node '{node}' references unknown capability '{capability}'")]
    UnknownCapability { node: String, capability: String },

    // === Step Errors ===
    #[error("Step '{node}' failed: {message}")]
    StepFailed { node: String, message: String },

    #[error("{0}")]
    Capability(String),

    #[error("Traversal has already reached a terminal state")]
    TraversalFinished,

    // === Collaborator Errors ===
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl FlowError {
    /// Shorthand for a capability-raised error.
    pub fn capability(message: impl Into<String>) -> Self {
        FlowError::Capability(message.into())
    }

    /// Returns `true` for errors raised while turning a definition into a
    /// compiled graph. These never surface mid-traversal.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FlowError::ValidationError(_) | FlowError::UnknownCapability { .. }
        )
    }

    /// Maps the error to an HTTP status code for a transport layer.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            FlowError::ValidationError(_) | FlowError::UnknownCapability { .. } => Some(400),
            FlowError::NotFound { .. } => Some(404),
            FlowError::Json(_) => Some(422),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, FlowError>`.
pub type Result<T> = std::result::Result<T, FlowError>;

// ---------------------------------------------------------------------------
// RunState: the mutable mapping owned by one run
// ---------------------------------------------------------------------------

/// Key-value state threaded through every step of a single run.
///
/// A run owns its state outright; there is no interior mutability and no
/// sharing. [`snapshot`](RunState::snapshot) yields an independent copy for
/// log entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunState {
    values: Map<String, Value>,
}

impl RunState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Convenience accessor that returns a `String`. Falls back to `default`
    /// when the key is absent or not a JSON string.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| default.to_owned())
    }

    /// Numeric accessor; integers are widened to `f64`.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    /// Insert or overwrite a key.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Merge `updates` into the state. Existing keys not present in
    /// `updates` are preserved; keys present in both take the new value.
    pub fn apply_updates(&mut self, updates: Map<String, Value>) {
        self.values.extend(updates);
    }

    /// Independent deep copy of the current values.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.clone()
    }

    /// Borrow the underlying mapping.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Map<String, Value>> for RunState {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

impl TryFrom<Value> for RunState {
    type Error = FlowError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(values) => Ok(Self { values }),
            Value::Null => Ok(Self::new()),
            other => Err(FlowError::Other(format!(
                "run state must be a JSON object, got {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// LogStatus: status of a single execution log entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    #[default]
    Pending,
    Success,
    Error,
}

// ---------------------------------------------------------------------------
// ExecutionLog: one entry per executed node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub input_state: Map<String, Value>,
    #[serde(default)]
    pub output_state: Map<String, Value>,
    #[serde(default)]
    pub status: LogStatus,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionLog {
    /// Open a pending entry, snapshotting `state` as the input.
    pub fn pending(node_id: impl Into<String>, state: &RunState) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp: Utc::now(),
            input_state: state.snapshot(),
            output_state: Map::new(),
            status: LogStatus::Pending,
            duration_ms: 0.0,
            error: None,
        }
    }

    /// Close the entry as successful with a snapshot of the resulting state.
    pub fn succeed(&mut self, state: &RunState) {
        self.output_state = state.snapshot();
        self.status = LogStatus::Success;
        self.stamp_duration();
    }

    /// Close the entry as failed with the raised message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.status = LogStatus::Error;
        self.stamp_duration();
    }

    fn stamp_duration(&mut self) {
        let elapsed = Utc::now() - self.timestamp;
        self.duration_ms = elapsed
            .num_microseconds()
            .map(|us| us as f64 / 1000.0)
            .unwrap_or_else(|| elapsed.num_milliseconds() as f64);
    }
}

// ---------------------------------------------------------------------------
// Termination: how a traversal stopped without failing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// No next node resolved, or a loop gate's condition was false.
    Completed,
    /// The global iteration ceiling was exceeded.
    IterationCeiling { limit: usize },
    /// A loop gate's visit count exceeded its maximum.
    LoopCeiling { node_id: String, max_iterations: u32 },
}

impl Termination {
    /// `true` for the ceiling variants.
    pub fn is_truncated(&self) -> bool {
        !matches!(self, Termination::Completed)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Completed => write!(f, "completed"),
            Termination::IterationCeiling { limit } => {
                write!(f, "truncated at iteration ceiling ({limit})")
            }
            Termination::LoopCeiling {
                node_id,
                max_iterations,
            } => write!(
                f,
                "truncated at loop ceiling for '{node_id}' ({max_iterations})"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus / ExecutionResult: the persisted run record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses stamp `completed_at` on the record.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a workflow run as stored by the run store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    pub initial_state: RunState,
    #[serde(default)]
    pub final_state: RunState,
    #[serde(default)]
    pub logs: Vec<ExecutionLog>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
}

impl ExecutionResult {
    /// A fresh `pending` record.
    pub fn pending(
        run_id: impl Into<String>,
        graph_id: impl Into<String>,
        initial_state: RunState,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            graph_id: graph_id.into(),
            status: RunStatus::Pending,
            initial_state,
            final_state: RunState::new(),
            logs: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            termination: None,
        }
    }

    /// Wall-clock duration, available once the run reached a terminal status.
    pub fn duration_seconds(&self) -> Option<f64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }

    /// The state a poller should see: the final state once the run reached a
    /// terminal status, otherwise the initial state. A run may legitimately
    /// finish with an empty state.
    pub fn current_state(&self) -> &RunState {
        if self.status.is_terminal() {
            &self.final_state
        } else {
            &self.initial_state
        }
    }
}
