//! The engine's resolved, immutable graph representation.

use std::collections::HashMap;

use flowgraph_types::{FlowError, Result};

use crate::definition::{EdgeKind, GraphDefinition, LoopSpec};
use crate::registry::CapabilityRegistry;
use crate::step::Step;
use crate::validation::validate_or_raise;

/// A conditional transition out of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalEdge {
    pub to: String,
    pub condition: String,
}

/// Built once from a [`GraphDefinition`]; immutable thereafter and safe to
/// share read-only across concurrent runs.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub name: String,
    pub graph_id: Option<String>,
    entry_node: String,
    steps: HashMap<String, Step>,
    /// Ordered direct successors per source node.
    direct: HashMap<String, Vec<String>>,
    /// Ordered (target, condition) pairs per source node.
    conditional: HashMap<String, Vec<ConditionalEdge>>,
    loops: HashMap<String, LoopSpec>,
}

impl CompiledGraph {
    pub fn entry_node(&self) -> &str {
        &self.entry_node
    }

    pub fn step(&self, node_id: &str) -> Option<&Step> {
        self.steps.get(node_id)
    }

    pub fn direct_successors(&self, node_id: &str) -> &[String] {
        self.direct.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn conditional_edges(&self, node_id: &str) -> &[ConditionalEdge] {
        self.conditional.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn loop_spec(&self, node_id: &str) -> Option<&LoopSpec> {
        self.loops.get(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.steps.len()
    }

    /// Identifier reported in run events: the persisted id, else the name.
    pub fn id_or_name(&self) -> &str {
        self.graph_id.as_deref().unwrap_or(&self.name)
    }
}

/// Compile a definition against a capability registry.
///
/// Structural errors and unknown capability names are configuration errors;
/// nothing here runs a step or evaluates a condition.
pub fn compile(def: &GraphDefinition, registry: &CapabilityRegistry) -> Result<CompiledGraph> {
    validate_or_raise(def)?;

    let mut steps = HashMap::with_capacity(def.nodes.len());
    for node in &def.nodes {
        let step = match &node.tool_name {
            Some(name) => {
                let capability = registry.get(name).ok_or_else(|| FlowError::UnknownCapability {
                    node: node.node_id.clone(),
                    capability: name.clone(),
                })?;
                Step::Capability {
                    node_id: node.node_id.clone(),
                    capability: capability.clone(),
                    config: node.config.clone(),
                }
            }
            None => Step::Identity {
                node_id: node.node_id.clone(),
            },
        };
        steps.insert(node.node_id.clone(), step);
    }

    let mut direct: HashMap<String, Vec<String>> = HashMap::new();
    let mut conditional: HashMap<String, Vec<ConditionalEdge>> = HashMap::new();
    for edge in &def.edges {
        match edge.edge_type {
            EdgeKind::Direct => direct
                .entry(edge.from_node.clone())
                .or_default()
                .push(edge.to_node.clone()),
            EdgeKind::Conditional => conditional
                .entry(edge.from_node.clone())
                .or_default()
                .push(ConditionalEdge {
                    to: edge.to_node.clone(),
                    // An absent condition never parses, so the edge is never taken.
                    condition: edge.condition.clone().unwrap_or_default(),
                }),
        }
    }

    let mut loops: HashMap<String, LoopSpec> = HashMap::new();
    for spec in &def.loops {
        if loops.contains_key(&spec.loop_node) {
            tracing::warn!(
                node = %spec.loop_node,
                condition = %spec.condition,
                "Ignoring duplicate loop spec; the first declared one is used"
            );
            continue;
        }
        loops.insert(spec.loop_node.clone(), spec.clone());
    }

    tracing::debug!(
        graph = %def.name,
        nodes = steps.len(),
        edges = def.edges.len(),
        loops = loops.len(),
        "Compiled graph"
    );

    Ok(CompiledGraph {
        name: def.name.clone(),
        graph_id: def.graph_id.clone(),
        entry_node: def.entry_node.clone(),
        steps,
        direct,
        conditional,
        loops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeSpec;
    use crate::registry::StepOutput;

    fn registry() -> CapabilityRegistry {
        let mut reg = CapabilityRegistry::new();
        reg.register_fn("increment", |_, _| Ok(StepOutput::unchanged()));
        reg.register_fn("multiply", |_, _| Ok(StepOutput::unchanged()));
        reg
    }

    #[test]
    fn compiles_steps_and_adjacency() {
        let def = GraphDefinition::new("G", "add")
            .with_node(NodeSpec::tool("add", "increment"))
            .with_node(NodeSpec::passthrough("check"))
            .with_node(NodeSpec::tool("multiply", "multiply"))
            .edge("add", "check")
            .conditional("check", "multiply", "counter > 5")
            .edge("check", "add");

        let graph = compile(&def, &registry()).unwrap();
        assert_eq!(graph.entry_node(), "add");
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.step("add").unwrap().capability_name(), Some("increment"));
        assert!(matches!(graph.step("check"), Some(Step::Identity { .. })));
        assert_eq!(graph.direct_successors("add"), ["check".to_string()]);
        assert_eq!(graph.direct_successors("check"), ["add".to_string()]);
        assert_eq!(
            graph.conditional_edges("check"),
            [ConditionalEdge {
                to: "multiply".into(),
                condition: "counter > 5".into()
            }]
        );
        assert!(graph.direct_successors("multiply").is_empty());
        assert!(graph.conditional_edges("add").is_empty());
    }

    #[test]
    fn edge_declaration_order_is_preserved() {
        let def = GraphDefinition::new("G", "a")
            .with_node(NodeSpec::passthrough("a"))
            .with_node(NodeSpec::passthrough("b"))
            .with_node(NodeSpec::passthrough("c"))
            .conditional("a", "c", "x == 2")
            .conditional("a", "b", "x == 1")
            .edge("a", "c")
            .edge("a", "b");
        let graph = compile(&def, &registry()).unwrap();
        let conds: Vec<_> = graph.conditional_edges("a").iter().map(|e| e.to.as_str()).collect();
        assert_eq!(conds, ["c", "b"]);
        assert_eq!(graph.direct_successors("a"), ["c".to_string(), "b".to_string()]);
    }

    #[test]
    fn unknown_capability_is_fatal() {
        let def = GraphDefinition::new("G", "a").with_node(NodeSpec::tool("a", "add_one"));
        let err = compile(&def, &registry()).unwrap_err();
        assert!(
            matches!(err, FlowError::UnknownCapability { ref node, ref capability }
                if node == "a" && capability == "add_one")
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn dangling_reference_is_fatal() {
        let def = GraphDefinition::new("G", "a")
            .with_node(NodeSpec::passthrough("a"))
            .edge("a", "ghost");
        let err = compile(&def, &registry()).unwrap_err();
        assert!(matches!(err, FlowError::ValidationError(_)));
    }

    #[test]
    fn first_declared_loop_wins() {
        let def = GraphDefinition::new("G", "a")
            .with_node(NodeSpec::passthrough("a"))
            .loop_on("a", "first", 2)
            .loop_on("a", "second", 7);
        let graph = compile(&def, &registry()).unwrap();
        let spec = graph.loop_spec("a").unwrap();
        assert_eq!(spec.condition, "first");
        assert_eq!(spec.max_iterations, 2);
    }

    #[test]
    fn compilation_is_deterministic() {
        let def = GraphDefinition::new("G", "add")
            .with_node(NodeSpec::tool("add", "increment"))
            .with_node(NodeSpec::tool("multiply", "multiply"))
            .edge("add", "multiply")
            .loop_on("add", "counter < 3", 4);
        let a = compile(&def, &registry()).unwrap();
        let b = compile(&def, &registry()).unwrap();
        assert_eq!(a.direct, b.direct);
        assert_eq!(a.conditional, b.conditional);
        assert_eq!(a.loops, b.loops);
        assert_eq!(a.steps.len(), b.steps.len());
    }

    #[test]
    fn id_or_name_prefers_persisted_id() {
        let mut def = GraphDefinition::new("Named", "a").with_node(NodeSpec::passthrough("a"));
        let graph = compile(&def, &registry()).unwrap();
        assert_eq!(graph.id_or_name(), "Named");
        def.graph_id = Some("g-1".into());
        let graph = compile(&def, &registry()).unwrap();
        assert_eq!(graph.id_or_name(), "g-1");
    }
}
