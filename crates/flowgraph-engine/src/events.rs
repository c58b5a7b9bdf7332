//! Events emitted to an observer while a run streams.
//!
//! Serialized with a `type` tag so transport layers can forward them as-is,
//! one JSON object per event.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use flowgraph_types::{RunStatus, Termination};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        graph_id: String,
    },
    NodeStart {
        node_id: String,
        iteration: usize,
    },
    NodeComplete {
        node_id: String,
        state: Map<String, Value>,
        duration_ms: f64,
    },
    NodeError {
        node_id: String,
        error: String,
    },
    Completed {
        status: RunStatus,
        final_state: Map<String, Value>,
        iterations: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        termination: Option<Termination>,
    },
}

impl RunEvent {
    /// The `type` tag value.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::Started { .. } => "started",
            RunEvent::NodeStart { .. } => "node_start",
            RunEvent::NodeComplete { .. } => "node_complete",
            RunEvent::NodeError { .. } => "node_error",
            RunEvent::Completed { .. } => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Completed { .. })
    }
}
