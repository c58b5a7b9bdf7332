//! Traversal engine: the per-node state machine and the batch driver.
//!
//! [`Traversal`] owns one run's state, visit counters, and log. Its
//! single-step primitive is split in two: [`Traversal::enter`] applies the
//! iteration ceiling and loop gate, [`Traversal::execute_entered`] runs the
//! node and resolves its successor. [`Traversal::step`] composes them for
//! drivers that have nothing to do in between; the streaming driver emits
//! `node_start` there.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use flowgraph_types::{ExecutionLog, FlowError, Result, RunState, Termination};

use crate::condition::{ConditionEvaluator, ExpressionEvaluator};
use crate::graph::CompiledGraph;

/// Default global iteration ceiling per run.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_iterations: usize,
    /// Capacity of the observer channel in streaming mode.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            event_buffer: 64,
        }
    }
}

impl EngineConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Ready,
    Running,
    Finished(Termination),
    Failed,
}

/// Outcome of [`Traversal::enter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// The node passed the ceiling and loop checks and is ready to run.
    Enter { node_id: String, iteration: usize },
    Halt(Termination),
}

/// Outcome of one full step.
#[derive(Debug, Clone)]
pub enum Advance {
    /// A node ran. `next` is `None` when no transition applied and the
    /// traversal is now finished.
    Stepped {
        entry: ExecutionLog,
        next: Option<String>,
    },
    Halted(Termination),
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub final_state: RunState,
    pub logs: Vec<ExecutionLog>,
    pub iterations: usize,
    pub termination: Termination,
}

/// A step raised. Carries the error plus what the run produced up to and
/// including the failing log entry.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: FlowError,
    pub state: RunState,
    pub logs: Vec<ExecutionLog>,
    pub iterations: usize,
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

pub struct Traversal<'g> {
    graph: &'g CompiledGraph,
    evaluator: Arc<dyn ConditionEvaluator>,
    state: RunState,
    current: String,
    visits: HashMap<String, u32>,
    iterations: usize,
    max_iterations: usize,
    logs: Vec<ExecutionLog>,
    phase: Phase,
    entered: bool,
}

impl<'g> Traversal<'g> {
    pub fn new(graph: &'g CompiledGraph, state: RunState, max_iterations: usize) -> Self {
        Self {
            graph,
            evaluator: Arc::new(ExpressionEvaluator),
            state,
            current: graph.entry_node().to_string(),
            visits: HashMap::new(),
            iterations: 0,
            max_iterations,
            logs: Vec::new(),
            phase: Phase::Ready,
            entered: false,
        }
    }

    /// Replace the condition evaluator used for edges and loop gates.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn logs(&self) -> &[ExecutionLog] {
        &self.logs
    }

    /// Iterations entered so far, including ones halted by a loop gate.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn current_node(&self) -> &str {
        &self.current
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished(_) | Phase::Failed)
    }

    pub fn termination(&self) -> Option<&Termination> {
        match &self.phase {
            Phase::Finished(t) => Some(t),
            _ => None,
        }
    }

    fn halt(&mut self, termination: Termination) -> Gate {
        self.phase = Phase::Finished(termination.clone());
        Gate::Halt(termination)
    }

    /// Ceiling check, loop gate, and step lookup for the current node.
    ///
    /// Calling it again before [`execute_entered`](Self::execute_entered)
    /// returns the same gate without counting another visit.
    pub fn enter(&mut self) -> Result<Gate> {
        match self.phase {
            Phase::Finished(_) | Phase::Failed => return Err(FlowError::TraversalFinished),
            Phase::Ready => self.phase = Phase::Running,
            Phase::Running => {}
        }
        if self.entered {
            return Ok(Gate::Enter {
                node_id: self.current.clone(),
                iteration: self.iterations,
            });
        }

        let graph = self.graph;
        let node_id = self.current.clone();
        let visits = {
            let count = self.visits.entry(node_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if self.iterations >= self.max_iterations {
            tracing::warn!(
                node = %node_id,
                limit = self.max_iterations,
                "Iteration ceiling reached, stopping run"
            );
            return Ok(self.halt(Termination::IterationCeiling {
                limit: self.max_iterations,
            }));
        }
        self.iterations += 1;

        if let Some(spec) = graph.loop_spec(&node_id) {
            if !self.evaluator.evaluate(&spec.condition, &self.state) {
                tracing::info!(
                    node = %node_id,
                    condition = %spec.condition,
                    "Loop condition false, exiting loop"
                );
                return Ok(self.halt(Termination::Completed));
            }
            if visits > spec.max_iterations {
                tracing::warn!(
                    node = %node_id,
                    max_iterations = spec.max_iterations,
                    "Loop ceiling reached, stopping run"
                );
                return Ok(self.halt(Termination::LoopCeiling {
                    node_id,
                    max_iterations: spec.max_iterations,
                }));
            }
        }

        if graph.step(&node_id).is_none() {
            tracing::error!(node = %node_id, "No step bound to node");
            self.phase = Phase::Failed;
            return Err(FlowError::StepFailed {
                node: node_id,
                message: "no step bound to node".into(),
            });
        }

        self.entered = true;
        Ok(Gate::Enter {
            node_id,
            iteration: self.iterations,
        })
    }

    /// Run the entered node, log it, and move to its successor.
    pub async fn execute_entered(&mut self) -> Result<Advance> {
        if self.is_finished() {
            return Err(FlowError::TraversalFinished);
        }
        if !self.entered {
            return Err(FlowError::Other(format!(
                "node '{}' must be entered before it is executed",
                self.current
            )));
        }
        self.entered = false;

        let graph = self.graph;
        let node_id = self.current.clone();
        let step = graph.step(&node_id).ok_or_else(|| FlowError::StepFailed {
            node: node_id.clone(),
            message: "no step bound to node".into(),
        })?;

        let mut entry = ExecutionLog::pending(&node_id, &self.state);
        tracing::info!(node = %node_id, iteration = self.iterations, "Executing node");

        if let Err(err) = step.execute(&mut self.state).await {
            entry.fail(err.to_string());
            tracing::error!(
                node = %node_id,
                error = %err,
                duration_ms = entry.duration_ms,
                "Node failed"
            );
            self.logs.push(entry);
            self.phase = Phase::Failed;
            return Err(err);
        }
        entry.succeed(&self.state);
        tracing::info!(node = %node_id, duration_ms = entry.duration_ms, "Node completed");
        self.logs.push(entry.clone());

        let next = self.resolve_next(&node_id);
        match &next {
            Some(target) => self.current = target.clone(),
            None => {
                tracing::info!(node = %node_id, "No outgoing transition, run complete");
                self.phase = Phase::Finished(Termination::Completed);
            }
        }
        Ok(Advance::Stepped { entry, next })
    }

    /// [`enter`](Self::enter) then [`execute_entered`](Self::execute_entered).
    pub async fn step(&mut self) -> Result<Advance> {
        match self.enter()? {
            Gate::Enter { .. } => self.execute_entered().await,
            Gate::Halt(termination) => Ok(Advance::Halted(termination)),
        }
    }

    /// First conditional edge whose condition holds, else the first direct edge.
    fn resolve_next(&self, node_id: &str) -> Option<String> {
        for edge in self.graph.conditional_edges(node_id) {
            if self.evaluator.evaluate(&edge.condition, &self.state) {
                tracing::debug!(
                    from = %node_id,
                    to = %edge.to,
                    condition = %edge.condition,
                    "Taking conditional edge"
                );
                return Some(edge.to.clone());
            }
        }
        let next = self.graph.direct_successors(node_id).first().cloned();
        if let Some(ref to) = next {
            tracing::debug!(from = %node_id, to = %to, "Taking direct edge");
        }
        next
    }

    /// Drive to a terminal state.
    pub async fn run_to_end(mut self) -> std::result::Result<RunReport, RunFailure> {
        loop {
            match self.step().await {
                Ok(Advance::Stepped { .. }) => {
                    if let Some(termination) = self.termination().cloned() {
                        return Ok(self.into_report(termination));
                    }
                }
                Ok(Advance::Halted(termination)) => return Ok(self.into_report(termination)),
                Err(error) => return Err(self.into_failure(error)),
            }
        }
    }

    /// Package the accumulated state and log as a report.
    pub fn into_report(self, termination: Termination) -> RunReport {
        RunReport {
            final_state: self.state,
            logs: self.logs,
            iterations: self.iterations,
            termination,
        }
    }

    /// Package the accumulated state and log with the error that ended the run.
    pub fn into_failure(self, error: FlowError) -> RunFailure {
        RunFailure {
            error,
            state: self.state,
            logs: self.logs,
            iterations: self.iterations,
        }
    }
}

/// Batch mode: run `graph` from its entry node to a terminal state.
pub async fn run(
    graph: &CompiledGraph,
    state: RunState,
    max_iterations: usize,
) -> std::result::Result<RunReport, RunFailure> {
    tracing::info!(graph = %graph.name, max_iterations, "Starting run");
    let result = Traversal::new(graph, state, max_iterations).run_to_end().await;
    match &result {
        Ok(report) => tracing::info!(
            graph = %graph.name,
            iterations = report.iterations,
            termination = %report.termination,
            "Run finished"
        ),
        Err(failure) => tracing::error!(graph = %graph.name, error = %failure.error, "Run failed"),
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{GraphDefinition, NodeSpec};
    use crate::graph::compile;
    use crate::registry::{CapabilityRegistry, StepOutput};
    use flowgraph_types::LogStatus;
    use serde_json::{json, Value};

    fn registry() -> CapabilityRegistry {
        let mut reg = CapabilityRegistry::new();
        reg.register_fn("increment", |state, _| {
            let n = state.get("counter").and_then(Value::as_i64).unwrap_or(0);
            Ok(StepOutput::set("counter", json!(n + 1)))
        });
        reg.register_fn("fail", |_, _| Err(FlowError::capability("kaput")));
        reg
    }

    fn counter(n: i64) -> RunState {
        RunState::try_from(json!({ "counter": n })).unwrap()
    }

    fn self_loop(condition: &str, max: u32) -> CompiledGraph {
        let def = GraphDefinition::new("Loop", "inc")
            .with_node(NodeSpec::tool("inc", "increment"))
            .edge("inc", "inc")
            .loop_on("inc", condition, max);
        compile(&def, &registry()).unwrap()
    }

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_iterations, 100);
        assert_eq!(config.event_buffer, 64);
        let parsed: EngineConfig = serde_json::from_value(json!({"max_iterations": 7})).unwrap();
        assert_eq!(parsed, EngineConfig::default().with_max_iterations(7));
    }

    #[tokio::test]
    async fn phases_progress_from_ready_to_finished() {
        let def = GraphDefinition::new("One", "inc").with_node(NodeSpec::tool("inc", "increment"));
        let graph = compile(&def, &registry()).unwrap();
        let mut t = Traversal::new(&graph, counter(0), 10);
        assert_eq!(t.phase(), &Phase::Ready);

        let gate = t.enter().unwrap();
        assert_eq!(
            gate,
            Gate::Enter {
                node_id: "inc".into(),
                iteration: 1
            }
        );
        assert_eq!(t.phase(), &Phase::Running);

        let advance = t.execute_entered().await.unwrap();
        assert!(matches!(advance, Advance::Stepped { next: None, .. }));
        assert_eq!(t.termination(), Some(&Termination::Completed));
        assert!(matches!(t.step().await, Err(FlowError::TraversalFinished)));
    }

    #[tokio::test]
    async fn enter_is_idempotent_until_executed() {
        let graph = self_loop("true", 3);
        let mut t = Traversal::new(&graph, counter(0), 10);
        let first = t.enter().unwrap();
        let second = t.enter().unwrap();
        assert_eq!(first, second);
        assert_eq!(t.iterations(), 1);
    }

    #[tokio::test]
    async fn execute_without_enter_is_rejected() {
        let graph = self_loop("true", 3);
        let mut t = Traversal::new(&graph, counter(0), 10);
        assert!(matches!(t.execute_entered().await, Err(FlowError::Other(_))));
    }

    #[tokio::test]
    async fn iteration_ceiling_truncates() {
        let def = GraphDefinition::new("Spin", "inc")
            .with_node(NodeSpec::tool("inc", "increment"))
            .edge("inc", "inc");
        let graph = compile(&def, &registry()).unwrap();
        let report = run(&graph, counter(0), 4).await.unwrap();
        assert_eq!(report.termination, Termination::IterationCeiling { limit: 4 });
        assert_eq!(report.logs.len(), 4);
        assert_eq!(report.iterations, 4);
        assert_eq!(report.final_state.get("counter"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn zero_ceiling_runs_nothing() {
        let graph = self_loop("true", 3);
        let report = run(&graph, counter(0), 0).await.unwrap();
        assert!(report.logs.is_empty());
        assert_eq!(report.termination, Termination::IterationCeiling { limit: 0 });
    }

    #[tokio::test]
    async fn loop_condition_checked_before_each_visit() {
        let graph = self_loop("counter < 3", 10);
        let report = run(&graph, counter(0), 100).await.unwrap();
        assert_eq!(report.logs.len(), 3);
        assert_eq!(report.termination, Termination::Completed);
        assert_eq!(report.final_state.get("counter"), Some(&json!(3)));
        // The halting gate still counts as an iteration.
        assert_eq!(report.iterations, 4);
    }

    #[tokio::test]
    async fn loop_ceiling_truncates_after_max_visits() {
        let graph = self_loop("true", 3);
        let report = run(&graph, counter(0), 100).await.unwrap();
        assert_eq!(report.logs.len(), 3);
        assert_eq!(
            report.termination,
            Termination::LoopCeiling {
                node_id: "inc".into(),
                max_iterations: 3
            }
        );
    }

    #[tokio::test]
    async fn failure_preserves_log_and_state() {
        let def = GraphDefinition::new("Fails", "inc")
            .with_node(NodeSpec::tool("inc", "increment"))
            .with_node(NodeSpec::tool("boom", "fail"))
            .with_node(NodeSpec::tool("after", "increment"))
            .edge("inc", "boom")
            .edge("boom", "after");
        let graph = compile(&def, &registry()).unwrap();

        let failure = run(&graph, counter(0), 10).await.unwrap_err();
        assert_eq!(failure.to_string(), "kaput");
        assert_eq!(failure.logs.len(), 2);
        assert_eq!(failure.logs[1].node_id, "boom");
        assert_eq!(failure.logs[1].status, LogStatus::Error);
        assert_eq!(failure.logs[1].error.as_deref(), Some("kaput"));
        assert_eq!(failure.state.get("counter"), Some(&json!(1)));
        assert!(!failure.logs.iter().any(|l| l.node_id == "after"));
    }

    #[tokio::test]
    async fn failed_traversal_rejects_further_steps() {
        let def = GraphDefinition::new("Fails", "boom").with_node(NodeSpec::tool("boom", "fail"));
        let graph = compile(&def, &registry()).unwrap();
        let mut t = Traversal::new(&graph, RunState::new(), 10);
        assert!(t.step().await.is_err());
        assert_eq!(t.phase(), &Phase::Failed);
        assert!(matches!(t.enter(), Err(FlowError::TraversalFinished)));
    }

    #[tokio::test]
    async fn log_snapshots_are_independent() {
        let graph = self_loop("true", 2);
        let report = run(&graph, counter(0), 10).await.unwrap();
        assert_eq!(report.logs[0].input_state.get("counter"), Some(&json!(0)));
        assert_eq!(report.logs[0].output_state.get("counter"), Some(&json!(1)));
        assert_eq!(report.logs[1].input_state.get("counter"), Some(&json!(1)));
        assert_eq!(report.logs[1].output_state.get("counter"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn conditional_falls_back_to_direct() {
        let def = GraphDefinition::new("Branch", "a")
            .with_node(NodeSpec::passthrough("a"))
            .with_node(NodeSpec::passthrough("hot"))
            .with_node(NodeSpec::passthrough("cold"))
            .conditional("a", "hot", "counter > 10")
            .edge("a", "cold");
        let graph = compile(&def, &registry()).unwrap();
        let report = run(&graph, counter(1), 10).await.unwrap();
        let visited: Vec<_> = report.logs.iter().map(|l| l.node_id.as_str()).collect();
        assert_eq!(visited, ["a", "cold"]);
    }
}
