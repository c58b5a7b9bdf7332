//! Streaming mode: drive a traversal one node at a time, reporting each
//! transition to an observer channel before advancing.
//!
//! A closed channel cancels the run at the next emission.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use flowgraph_types::{ExecutionLog, RunState, RunStatus, Termination};

use crate::engine::{Advance, EngineConfig, Gate, Traversal};
use crate::events::RunEvent;
use crate::graph::CompiledGraph;

/// What a streamed run ended with.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub status: RunStatus,
    pub final_state: RunState,
    pub logs: Vec<ExecutionLog>,
    pub iterations: usize,
    pub termination: Option<Termination>,
    pub error: Option<String>,
}

impl StreamOutcome {
    fn from_traversal(
        traversal: Traversal<'_>,
        status: RunStatus,
        termination: Option<Termination>,
        error: Option<String>,
    ) -> Self {
        let iterations = traversal.iterations();
        let report = traversal.into_report(termination.clone().unwrap_or(Termination::Completed));
        Self {
            status,
            final_state: report.final_state,
            logs: report.logs,
            iterations,
            termination,
            error,
        }
    }
}

/// Send one event; `false` means the observer is gone.
async fn emit(observer: &mpsc::Sender<RunEvent>, event: RunEvent) -> bool {
    observer.send(event).await.is_ok()
}

fn cancelled(traversal: Traversal<'_>, graph: &CompiledGraph) -> StreamOutcome {
    tracing::warn!(
        graph = %graph.name,
        node = %traversal.current_node(),
        iterations = traversal.iterations(),
        "Observer disconnected, cancelling run"
    );
    StreamOutcome::from_traversal(
        traversal,
        RunStatus::Cancelled,
        None,
        Some("observer disconnected".into()),
    )
}

/// Run `graph` in streaming mode, sending events to `observer`.
///
/// Event order: `started`, then per node `node_start` followed by
/// `node_complete` or `node_error`, then one `completed`.
pub async fn stream_run(
    graph: &CompiledGraph,
    state: RunState,
    max_iterations: usize,
    observer: &mpsc::Sender<RunEvent>,
) -> StreamOutcome {
    let mut traversal = Traversal::new(graph, state, max_iterations);
    tracing::info!(graph = %graph.name, max_iterations, "Starting streamed run");

    let started = RunEvent::Started {
        graph_id: graph.id_or_name().to_string(),
    };
    if !emit(observer, started).await {
        return cancelled(traversal, graph);
    }

    let (status, termination, error) = loop {
        let node_id = match traversal.enter() {
            Ok(Gate::Enter { node_id, iteration }) => {
                let start = RunEvent::NodeStart { node_id: node_id.clone(), iteration };
                if !emit(observer, start).await {
                    return cancelled(traversal, graph);
                }
                node_id
            }
            Ok(Gate::Halt(termination)) => break (RunStatus::Completed, Some(termination), None),
            Err(err) => {
                let node_id = traversal.current_node().to_string();
                let message = err.to_string();
                if !emit(observer, RunEvent::NodeError { node_id, error: message.clone() }).await {
                    return cancelled(traversal, graph);
                }
                break (RunStatus::Failed, None, Some(message));
            }
        };

        match traversal.execute_entered().await {
            Ok(Advance::Stepped { entry, next }) => {
                let event = RunEvent::NodeComplete {
                    node_id,
                    state: entry.output_state,
                    duration_ms: entry.duration_ms,
                };
                if !emit(observer, event).await {
                    return cancelled(traversal, graph);
                }
                if next.is_none() {
                    break (RunStatus::Completed, Some(Termination::Completed), None);
                }
            }
            Ok(Advance::Halted(termination)) => {
                break (RunStatus::Completed, Some(termination), None)
            }
            Err(err) => {
                let message = err.to_string();
                if !emit(observer, RunEvent::NodeError { node_id, error: message.clone() }).await {
                    return cancelled(traversal, graph);
                }
                break (RunStatus::Failed, None, Some(message));
            }
        }
    };

    let completed = RunEvent::Completed {
        status,
        final_state: traversal.state().snapshot(),
        iterations: traversal.iterations(),
        termination: termination.clone(),
    };
    // The run has already finished; a departed observer does not change its outcome.
    if !emit(observer, completed).await {
        tracing::warn!(graph = %graph.name, "Observer disconnected before completion event");
    }

    tracing::info!(
        graph = %graph.name,
        status = %status,
        iterations = traversal.iterations(),
        "Streamed run finished"
    );
    StreamOutcome::from_traversal(traversal, status, termination, error)
}

/// Spawn a streamed run on the tokio runtime and hand back its events.
///
/// Dropping the returned stream cancels the run at its next emission.
pub fn spawn_stream(
    graph: Arc<CompiledGraph>,
    state: RunState,
    config: &EngineConfig,
) -> ReceiverStream<RunEvent> {
    let (tx, rx) = mpsc::channel(config.event_buffer.max(1));
    let max_iterations = config.max_iterations;
    tokio::spawn(async move {
        stream_run(&graph, state, max_iterations, &tx).await;
    });
    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{GraphDefinition, NodeSpec};
    use crate::graph::compile;
    use crate::registry::{CapabilityRegistry, StepOutput};
    use flowgraph_types::FlowError;
    use serde_json::{json, Value};
    use tokio_stream::StreamExt;

    fn registry() -> CapabilityRegistry {
        let mut reg = CapabilityRegistry::new();
        reg.register_fn("increment", |state, _| {
            let n = state.get("counter").and_then(Value::as_i64).unwrap_or(0);
            Ok(StepOutput::set("counter", json!(n + 1)))
        });
        reg.register_fn("fail", |_, _| Err(FlowError::capability("kaput")));
        reg
    }

    fn linear() -> CompiledGraph {
        let def = GraphDefinition::new("Linear", "a")
            .with_node(NodeSpec::tool("a", "increment"))
            .with_node(NodeSpec::tool("b", "increment"))
            .edge("a", "b");
        compile(&def, &registry()).unwrap()
    }

    fn counter(n: i64) -> RunState {
        RunState::try_from(json!({ "counter": n })).unwrap()
    }

    async fn collect(graph: &CompiledGraph, state: RunState) -> (Vec<RunEvent>, StreamOutcome) {
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = stream_run(graph, state, 100, &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, outcome)
    }

    #[tokio::test]
    async fn emits_ordered_events() {
        let graph = linear();
        let (events, outcome) = collect(&graph, counter(0)).await;
        let kinds: Vec<_> = events.iter().map(RunEvent::kind).collect();
        assert_eq!(
            kinds,
            ["started", "node_start", "node_complete", "node_start", "node_complete", "completed"]
        );
        assert_eq!(
            events.last(),
            Some(&RunEvent::Completed {
                status: RunStatus::Completed,
                final_state: counter(2).into_map(),
                iterations: 2,
                termination: Some(Termination::Completed),
            })
        );
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.logs.len(), 2);
    }

    #[tokio::test]
    async fn node_complete_carries_post_step_state() {
        let graph = linear();
        let (events, _) = collect(&graph, counter(0)).await;
        match &events[2] {
            RunEvent::NodeComplete { node_id, state, .. } => {
                assert_eq!(node_id, "a");
                assert_eq!(state.get("counter"), Some(&json!(1)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_emits_node_error_then_completed() {
        let def = GraphDefinition::new("Fails", "a")
            .with_node(NodeSpec::tool("a", "increment"))
            .with_node(NodeSpec::tool("boom", "fail"))
            .edge("a", "boom");
        let graph = compile(&def, &registry()).unwrap();
        let (events, outcome) = collect(&graph, counter(0)).await;

        let kinds: Vec<_> = events.iter().map(RunEvent::kind).collect();
        assert_eq!(
            kinds,
            ["started", "node_start", "node_complete", "node_start", "node_error", "completed"]
        );
        assert!(matches!(
            &events[5],
            RunEvent::Completed { status: RunStatus::Failed, termination: None, .. }
        ));
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("kaput"));
        assert_eq!(outcome.logs.len(), 2);
    }

    #[tokio::test]
    async fn loop_ceiling_reported_on_completed_event() {
        let def = GraphDefinition::new("Loop", "a")
            .with_node(NodeSpec::tool("a", "increment"))
            .edge("a", "a")
            .loop_on("a", "true", 2);
        let graph = compile(&def, &registry()).unwrap();
        let (events, outcome) = collect(&graph, counter(0)).await;
        assert!(matches!(
            events.last(),
            Some(RunEvent::Completed {
                termination: Some(Termination::LoopCeiling { .. }),
                ..
            })
        ));
        assert_eq!(outcome.logs.len(), 2);
    }

    #[tokio::test]
    async fn closed_observer_cancels_run() {
        let def = GraphDefinition::new("Spin", "a")
            .with_node(NodeSpec::tool("a", "increment"))
            .edge("a", "a");
        let graph = compile(&def, &registry()).unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let outcome = stream_run(&graph, counter(0), 100, &tx).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(outcome.logs.is_empty());
    }

    #[tokio::test]
    async fn observer_dropping_mid_run_stops_execution() {
        let def = GraphDefinition::new("Spin", "a")
            .with_node(NodeSpec::tool("a", "increment"))
            .edge("a", "a");
        let graph = compile(&def, &registry()).unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let reader = tokio::spawn(async move {
            // started, node_start, node_complete
            for _ in 0..3 {
                rx.recv().await;
            }
        });
        let outcome = stream_run(&graph, counter(0), 1_000, &tx).await;
        reader.await.unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(outcome.logs.len() < 1_000);
    }

    #[tokio::test]
    async fn observer_leaving_at_completion_keeps_outcome() {
        let def = GraphDefinition::new("Single", "a").with_node(NodeSpec::tool("a", "increment"));
        let graph = compile(&def, &registry()).unwrap();
        // Room for started, node_start and node_complete; completed must wait.
        let (tx, rx) = mpsc::channel(3);
        let (outcome, ()) = tokio::join!(stream_run(&graph, counter(0), 100, &tx), async move {
            tokio::task::yield_now().await;
            drop(rx);
        });
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.termination, Some(Termination::Completed));
        assert!(outcome.error.is_none());
        assert_eq!(outcome.logs.len(), 1);
        assert_eq!(outcome.final_state.get("counter"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn spawned_stream_yields_all_events() {
        let graph = Arc::new(linear());
        let events: Vec<RunEvent> = spawn_stream(graph, counter(0), &EngineConfig::default())
            .collect()
            .await;
        assert_eq!(events.len(), 6);
        assert!(events[5].is_terminal());
    }
}
