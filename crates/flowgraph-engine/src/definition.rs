//! Declarative, serializable graph definitions.
//!
//! A [`GraphDefinition`] is what callers author and what the graph store
//! persists. It is turned into a [`CompiledGraph`](crate::graph::CompiledGraph)
//! by [`compile`](crate::graph::compile).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Static configuration handed to a capability on every invocation.
pub type Config = Map<String, Value>;

/// Default per-loop visit ceiling.
pub const DEFAULT_LOOP_MAX_ITERATIONS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub loops: Vec<LoopSpec>,
    pub entry_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub node_id: String,
    /// Informational only; dispatch is decided by `tool_name`.
    #[serde(default = "default_node_type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub config: Config,
}

fn default_node_type() -> String {
    "tool".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Direct,
    Conditional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from_node: String,
    pub to_node: String,
    #[serde(default)]
    pub edge_type: EdgeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    pub loop_node: String,
    pub condition: String,
    #[serde(default = "default_loop_max")]
    pub max_iterations: u32,
}

fn default_loop_max() -> u32 {
    DEFAULT_LOOP_MAX_ITERATIONS
}

// --- Builders ---

impl GraphDefinition {
    /// Start an empty definition with the given name and entry node.
    pub fn new(name: impl Into<String>, entry_node: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            loops: Vec::new(),
            entry_node: entry_node.into(),
            graph_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Append a direct edge.
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(EdgeSpec::direct(from, to));
        self
    }

    /// Append a conditional edge.
    pub fn conditional(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        self.edges.push(EdgeSpec::conditional(from, to, condition));
        self
    }

    /// Append a loop gate on `node`.
    pub fn loop_on(
        mut self,
        node: impl Into<String>,
        condition: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        self.loops.push(LoopSpec {
            loop_node: node.into(),
            condition: condition.into(),
            max_iterations,
        });
        self
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.node(node_id).is_some()
    }
}

impl NodeSpec {
    /// A node bound to a registered capability.
    pub fn tool(node_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: default_node_type(),
            tool_name: Some(tool_name.into()),
            config: Config::new(),
        }
    }

    /// A structural node with no capability; it passes state through.
    pub fn passthrough(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: "passthrough".to_string(),
            tool_name: None,
            config: Config::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

impl EdgeSpec {
    pub fn direct(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from_node: from.into(),
            to_node: to.into(),
            edge_type: EdgeKind::Direct,
            condition: None,
        }
    }

    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            from_node: from.into(),
            to_node: to.into(),
            edge_type: EdgeKind::Conditional,
            condition: Some(condition.into()),
        }
    }
}
