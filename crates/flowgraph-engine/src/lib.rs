//! Graph workflow engine: capability registry, compiled graphs, traversal,
//! and the batch and streaming run envelopes.
//!
//! A [`GraphDefinition`] is validated and compiled against a
//! [`CapabilityRegistry`] into a [`CompiledGraph`], which [`run`] drives to
//! completion or [`stream_run`] drives while reporting every transition.
//! Loop gates, the global iteration ceiling and conditional routing are
//! evaluated by the sandboxed expression language in [`condition`].

pub mod capabilities;
pub mod condition;
pub mod definition;
pub mod engine;
pub mod events;
pub mod graph;
pub mod registry;
pub mod runner;
pub mod step;
pub mod store;
pub mod stream;
pub mod validation;

pub use capabilities::{code_review_graph, default_registry};
pub use condition::{
    evaluate_condition, parse_condition, truthy, ConditionError, ConditionEvaluator,
    ConditionExpr, ExpressionEvaluator,
};
pub use definition::{Config, EdgeKind, EdgeSpec, GraphDefinition, LoopSpec, NodeSpec};
pub use engine::{
    run, Advance, EngineConfig, Gate, Phase, RunFailure, RunReport, Traversal,
    DEFAULT_MAX_ITERATIONS,
};
pub use events::RunEvent;
pub use graph::{compile, CompiledGraph, ConditionalEdge};
pub use registry::{Capability, CapabilityRegistry, DynCapability, FnCapability, StepOutput};
pub use runner::{RunManager, RunSnapshot};
pub use step::Step;
pub use store::{FileStore, GraphStore, MemoryStore, RunStore};
pub use stream::{spawn_stream, stream_run, StreamOutcome};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
