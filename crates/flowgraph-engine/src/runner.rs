//! Run manager: owns the graph and run stores and drives both envelopes.
//!
//! Batch runs are spawned as background tokio tasks and polled through the
//! run store. Streamed runs hand events to the caller and record the outcome
//! when the stream ends.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use flowgraph_types::{ExecutionLog, ExecutionResult, FlowError, Result, RunState, RunStatus};

use crate::definition::GraphDefinition;
use crate::engine::{run, EngineConfig};
use crate::events::RunEvent;
use crate::graph::{compile, CompiledGraph};
use crate::registry::CapabilityRegistry;
use crate::store::{GraphStore, MemoryStore, RunStore};
use crate::stream;

/// What a poller sees for a run that may still be in flight.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub current_state: RunState,
    pub logs: Vec<ExecutionLog>,
}

#[derive(Clone)]
pub struct RunManager {
    registry: Arc<CapabilityRegistry>,
    graphs: Arc<dyn GraphStore>,
    runs: Arc<dyn RunStore>,
    config: EngineConfig,
}

impl RunManager {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        graphs: Arc<dyn GraphStore>,
        runs: Arc<dyn RunStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            graphs,
            runs,
            config,
        }
    }

    /// A manager backed by one shared [`MemoryStore`].
    pub fn in_memory(registry: CapabilityRegistry, config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(Arc::new(registry), store.clone(), store, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    // --- Graphs ---

    /// Validate, compile-check, assign an id if needed, and persist.
    pub async fn create_graph(&self, mut def: GraphDefinition) -> Result<GraphDefinition> {
        compile(&def, &self.registry)?;
        if def.graph_id.is_none() {
            def.graph_id = Some(Uuid::new_v4().to_string());
        }
        let def = self.graphs.create_graph(def).await?;
        tracing::info!(graph_id = ?def.graph_id, name = %def.name, "Created graph");
        Ok(def)
    }

    pub async fn get_graph(&self, graph_id: &str) -> Result<GraphDefinition> {
        self.graphs
            .get_graph(graph_id)
            .await?
            .ok_or_else(|| FlowError::NotFound {
                kind: "graph",
                id: graph_id.to_string(),
            })
    }

    pub async fn list_graphs(&self) -> Result<Vec<GraphDefinition>> {
        self.graphs.list_graphs().await
    }

    pub async fn delete_graph(&self, graph_id: &str) -> Result<()> {
        if !self.graphs.delete_graph(graph_id).await? {
            return Err(FlowError::NotFound {
                kind: "graph",
                id: graph_id.to_string(),
            });
        }
        tracing::info!(graph_id = %graph_id, "Deleted graph");
        Ok(())
    }

    async fn load(&self, graph_id: &str) -> Result<CompiledGraph> {
        let def = self.get_graph(graph_id).await?;
        compile(&def, &self.registry)
    }

    async fn open_record(&self, graph_id: &str, initial: &RunState) -> Result<ExecutionResult> {
        let record =
            ExecutionResult::pending(Uuid::new_v4().to_string(), graph_id, initial.clone());
        self.runs.create_run(&record).await?;
        Ok(record)
    }

    // --- Batch envelope ---

    /// Create a `pending` record and execute it on a background task.
    ///
    /// Configuration errors surface here rather than on the task.
    pub async fn start_run(&self, graph_id: &str, initial: RunState) -> Result<String> {
        let graph = self.load(graph_id).await?;
        let record = self.open_record(graph_id, &initial).await?;
        let run_id = record.run_id.clone();

        let manager = self.clone();
        tokio::spawn(async move {
            let run_id = record.run_id.clone();
            if let Err(err) = manager.execute_run(record, &graph).await {
                tracing::error!(run_id = %run_id, error = %err, "Failed to record run outcome");
            }
        });

        tracing::info!(run_id = %run_id, graph_id = %graph_id, "Run started");
        Ok(run_id)
    }

    /// Run inline and return the finished record.
    pub async fn run_now(&self, graph_id: &str, initial: RunState) -> Result<ExecutionResult> {
        let graph = self.load(graph_id).await?;
        let record = self.open_record(graph_id, &initial).await?;
        self.execute_run(record, &graph).await
    }

    /// Drive `record` from `running` to `completed` or `failed`.
    pub async fn execute_run(
        &self,
        mut record: ExecutionResult,
        graph: &CompiledGraph,
    ) -> Result<ExecutionResult> {
        record.status = RunStatus::Running;
        self.runs.update_run(&record).await?;

        match run(graph, record.initial_state.clone(), self.config.max_iterations).await {
            Ok(report) => {
                if report.termination.is_truncated() {
                    tracing::warn!(
                        run_id = %record.run_id,
                        termination = %report.termination,
                        "Run truncated"
                    );
                }
                record.status = RunStatus::Completed;
                record.final_state = report.final_state;
                record.logs = report.logs;
                record.termination = Some(report.termination);
            }
            Err(failure) => {
                record.status = RunStatus::Failed;
                record.error = Some(failure.error.to_string());
                record.final_state = failure.state;
                record.logs = failure.logs;
            }
        }
        record.completed_at = Some(Utc::now());
        self.runs.update_run(&record).await?;
        tracing::info!(run_id = %record.run_id, status = %record.status, "Run recorded");
        Ok(record)
    }

    pub async fn run_result(&self, run_id: &str) -> Result<ExecutionResult> {
        self.runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| FlowError::NotFound {
                kind: "run",
                id: run_id.to_string(),
            })
    }

    /// Status, current state, and logs recorded so far.
    pub async fn run_state(&self, run_id: &str) -> Result<RunSnapshot> {
        let record = self.run_result(run_id).await?;
        Ok(RunSnapshot {
            run_id: record.run_id.clone(),
            status: record.status,
            current_state: record.current_state().clone(),
            logs: record.logs,
        })
    }

    pub async fn list_runs(&self, graph_id: Option<&str>) -> Result<Vec<ExecutionResult>> {
        self.runs.list_runs(graph_id).await
    }

    // --- Streaming envelope ---

    /// Start a streamed run and return its events.
    ///
    /// The run record is created `running` and finalized when the stream
    /// ends, including `cancelled` if the receiver is dropped.
    pub async fn stream_run(
        &self,
        graph_id: &str,
        initial: RunState,
    ) -> Result<ReceiverStream<RunEvent>> {
        let graph = self.load(graph_id).await?;
        let mut record = self.open_record(graph_id, &initial).await?;
        record.status = RunStatus::Running;
        self.runs.update_run(&record).await?;

        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let runs = self.runs.clone();
        let max_iterations = self.config.max_iterations;
        tokio::spawn(async move {
            let outcome = stream::stream_run(&graph, initial, max_iterations, &tx).await;
            record.status = outcome.status;
            record.final_state = outcome.final_state;
            record.logs = outcome.logs;
            record.termination = outcome.termination;
            record.error = outcome.error;
            record.completed_at = Some(Utc::now());
            if let Err(err) = runs.update_run(&record).await {
                tracing::error!(
                    run_id = %record.run_id,
                    error = %err,
                    "Failed to record streamed run"
                );
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}
