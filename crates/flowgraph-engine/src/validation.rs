//! Graph definition validation: lint rules and diagnostics.
//!
//! Error-severity rules reject a definition before compilation. Warnings and
//! infos describe definitions that compile but probably do not do what the
//! author meant. Call [`validate`] for every diagnostic or
//! [`validate_or_raise`] to fail when any error is present.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use flowgraph_types::{FlowError, Result};

use crate::condition::parse_condition;
use crate::definition::{EdgeKind, GraphDefinition};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        })
    }
}

impl Diagnostic {
    fn new(rule: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message: message.into(),
            node_id: None,
            fix: None,
        }
    }

    fn at(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, def: &GraphDefinition) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct EntryExistsRule;
impl LintRule for EntryExistsRule {
    fn name(&self) -> &str { "entry_exists" }
    fn apply(&self, def: &GraphDefinition) -> Vec<Diagnostic> {
        if def.has_node(&def.entry_node) {
            return vec![];
        }
        vec![Diagnostic::new(
            self.name(),
            Severity::Error,
            format!("Entry node '{}' is not declared", def.entry_node),
        )
        .at(&def.entry_node)
        .fix("Set entry_node to the id of a declared node")]
    }
}

struct UniqueNodeIdsRule;
impl LintRule for UniqueNodeIdsRule {
    fn name(&self) -> &str { "unique_node_ids" }
    fn apply(&self, def: &GraphDefinition) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        let mut diags = Vec::new();
        for node in &def.nodes {
            if !seen.insert(node.node_id.as_str()) && reported.insert(node.node_id.as_str()) {
                diags.push(
                    Diagnostic::new(
                        self.name(),
                        Severity::Error,
                        format!("Node id '{}' is declared more than once", node.node_id),
                    )
                    .at(&node.node_id),
                );
            }
        }
        diags
    }
}

struct EdgeEndpointsExistRule;
impl LintRule for EdgeEndpointsExistRule {
    fn name(&self) -> &str { "edge_endpoints_exist" }
    fn apply(&self, def: &GraphDefinition) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for edge in &def.edges {
            for (end, id) in [("source", &edge.from_node), ("target", &edge.to_node)] {
                if !def.has_node(id) {
                    diags.push(
                        Diagnostic::new(
                            self.name(),
                            Severity::Error,
                            format!(
                                "Edge {} -> {} references undeclared {end} node '{id}'",
                                edge.from_node, edge.to_node
                            ),
                        )
                        .at(id),
                    );
                }
            }
        }
        diags
    }
}

struct LoopNodeExistsRule;
impl LintRule for LoopNodeExistsRule {
    fn name(&self) -> &str { "loop_node_exists" }
    fn apply(&self, def: &GraphDefinition) -> Vec<Diagnostic> {
        def.loops
            .iter()
            .filter(|l| !def.has_node(&l.loop_node))
            .map(|l| {
                Diagnostic::new(
                    self.name(),
                    Severity::Error,
                    format!("Loop references undeclared node '{}'", l.loop_node),
                )
                .at(&l.loop_node)
            })
            .collect()
    }
}

struct LoopMaxIterationsRule;
impl LintRule for LoopMaxIterationsRule {
    fn name(&self) -> &str { "loop_max_iterations" }
    fn apply(&self, def: &GraphDefinition) -> Vec<Diagnostic> {
        def.loops
            .iter()
            .filter(|l| l.max_iterations < 1)
            .map(|l| {
                Diagnostic::new(
                    self.name(),
                    Severity::Error,
                    format!(
                        "Loop on '{}' has max_iterations {}; must be at least 1",
                        l.loop_node, l.max_iterations
                    ),
                )
                .at(&l.loop_node)
            })
            .collect()
    }
}

struct ConditionalHasConditionRule;
impl LintRule for ConditionalHasConditionRule {
    fn name(&self) -> &str { "conditional_has_condition" }
    fn apply(&self, def: &GraphDefinition) -> Vec<Diagnostic> {
        def.edges
            .iter()
            .filter(|e| e.edge_type == EdgeKind::Conditional)
            .filter(|e| e.condition.as_deref().map_or(true, |c| c.trim().is_empty()))
            .map(|e| {
                Diagnostic::new(
                    self.name(),
                    Severity::Warning,
                    format!(
                        "Conditional edge {} -> {} has no condition and will never be taken",
                        e.from_node, e.to_node
                    ),
                )
                .at(&e.from_node)
                .fix("Add a condition or change edge_type to direct")
            })
            .collect()
    }
}

struct ConditionSyntaxRule;
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str { "condition_syntax" }
    fn apply(&self, def: &GraphDefinition) -> Vec<Diagnostic> {
        let edge_conditions = def.edges.iter().filter_map(|e| {
            let cond = e.condition.as_deref()?;
            (e.edge_type == EdgeKind::Conditional && !cond.trim().is_empty())
                .then(|| (format!("edge {} -> {}", e.from_node, e.to_node), &e.from_node, cond))
        });
        let loop_conditions = def
            .loops
            .iter()
            .map(|l| (format!("loop on '{}'", l.loop_node), &l.loop_node, l.condition.as_str()));

        edge_conditions
            .chain(loop_conditions)
            .filter_map(|(site, node, cond)| {
                let err = parse_condition(cond).err()?;
                Some(
                    Diagnostic::new(
                        self.name(),
                        Severity::Warning,
                        format!("Condition on {site} does not parse and will always be false: {err}"),
                    )
                    .at(node),
                )
            })
            .collect()
    }
}

struct DuplicateLoopRule;
impl LintRule for DuplicateLoopRule {
    fn name(&self) -> &str { "duplicate_loop" }
    fn apply(&self, def: &GraphDefinition) -> Vec<Diagnostic> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for l in &def.loops {
            *counts.entry(l.loop_node.as_str()).or_default() += 1;
        }
        let mut dups: Vec<_> = counts.into_iter().filter(|(_, n)| *n > 1).collect();
        dups.sort_unstable();
        dups.into_iter()
            .map(|(node, n)| {
                Diagnostic::new(
                    self.name(),
                    Severity::Warning,
                    format!("Node '{node}' has {n} loop specs; only the first declared is used"),
                )
                .at(node)
                .fix("Remove the extra loop specs")
            })
            .collect()
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, def: &GraphDefinition) -> Vec<Diagnostic> {
        if !def.has_node(&def.entry_node) {
            // Already reported by entry_exists.
            return vec![];
        }
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for e in &def.edges {
            adjacency.entry(&e.from_node).or_default().push(&e.to_node);
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue = VecDeque::from([def.entry_node.as_str()]);
        visited.insert(&def.entry_node);
        while let Some(current) = queue.pop_front() {
            for next in adjacency.get(current).into_iter().flatten() {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        def.nodes
            .iter()
            .filter(|n| !visited.contains(n.node_id.as_str()))
            .map(|n| {
                Diagnostic::new(
                    self.name(),
                    Severity::Warning,
                    format!(
                        "Node '{}' is not reachable from entry '{}'",
                        n.node_id, def.entry_node
                    ),
                )
                .at(&n.node_id)
            })
            .collect()
    }
}

struct DirectFanoutRule;
impl LintRule for DirectFanoutRule {
    fn name(&self) -> &str { "direct_fanout" }
    fn apply(&self, def: &GraphDefinition) -> Vec<Diagnostic> {
        let mut direct: Vec<(&str, Vec<&str>)> = Vec::new();
        for e in def.edges.iter().filter(|e| e.edge_type == EdgeKind::Direct) {
            match direct.iter_mut().find(|(from, _)| *from == e.from_node) {
                Some((_, targets)) => targets.push(e.to_node.as_str()),
                None => direct.push((e.from_node.as_str(), vec![e.to_node.as_str()])),
            }
        }
        direct
            .into_iter()
            .filter(|(_, targets)| targets.len() > 1)
            .map(|(from, targets)| {
                Diagnostic::new(
                    self.name(),
                    Severity::Info,
                    format!(
                        "Node '{from}' has {} direct edges; only the first ('{}') is ever taken",
                        targets.len(),
                        targets[0]
                    ),
                )
                .at(from)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all lint rules and return all diagnostics.
pub fn validate(def: &GraphDefinition) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(EntryExistsRule),
        Box::new(UniqueNodeIdsRule),
        Box::new(EdgeEndpointsExistRule),
        Box::new(LoopNodeExistsRule),
        Box::new(LoopMaxIterationsRule),
        Box::new(ConditionalHasConditionRule),
        Box::new(ConditionSyntaxRule),
        Box::new(DuplicateLoopRule),
        Box::new(ReachabilityRule),
        Box::new(DirectFanoutRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(def));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(def: &GraphDefinition) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(def);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(FlowError::ValidationError(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
