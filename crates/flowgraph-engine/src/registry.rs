//! Capability trait, dynamic dispatch wrapper, and capability registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use flowgraph_types::{Result, RunState};

use crate::definition::Config;

// ---------------------------------------------------------------------------
// StepOutput
// ---------------------------------------------------------------------------

/// What a capability hands back to its step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// Merged key-by-key into the live state.
    Merge(Map<String, Value>),
    /// Replaces the live state outright.
    Replace(RunState),
}

impl StepOutput {
    /// A merge of a single key.
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        let mut updates = Map::new();
        updates.insert(key.into(), value);
        StepOutput::Merge(updates)
    }

    /// A merge that changes nothing.
    pub fn unchanged() -> Self {
        StepOutput::Merge(Map::new())
    }
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Capability: Send + Sync {
    /// The name nodes use to bind this capability (`tool_name`).
    fn name(&self) -> &str;

    /// Run against the current state with the node's static configuration.
    async fn invoke(&self, state: &RunState, config: &Config) -> Result<StepOutput>;
}

// ---------------------------------------------------------------------------
// DynCapability: cloneable, object-safe handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DynCapability(Arc<dyn Capability>);

impl DynCapability {
    pub fn new(capability: impl Capability + 'static) -> Self {
        Self(Arc::new(capability))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub async fn invoke(&self, state: &RunState, config: &Config) -> Result<StepOutput> {
        self.0.invoke(state, config).await
    }
}

impl fmt::Debug for DynCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DynCapability").field(&self.name()).finish()
    }
}

// ---------------------------------------------------------------------------
// FnCapability: synchronous closures
// ---------------------------------------------------------------------------

type CapabilityFn = dyn Fn(&RunState, &Config) -> Result<StepOutput> + Send + Sync;

/// Adapts a plain closure into a [`Capability`].
pub struct FnCapability {
    name: String,
    func: Box<CapabilityFn>,
}

impl FnCapability {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&RunState, &Config) -> Result<StepOutput> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Capability for FnCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, state: &RunState, config: &Config) -> Result<StepOutput> {
        (self.func)(state, config)
    }
}

// ---------------------------------------------------------------------------
// CapabilityRegistry
// ---------------------------------------------------------------------------

/// Lookup table from capability name to implementation.
///
/// Populated at startup and passed explicitly to [`compile`](crate::graph::compile);
/// read-only while runs are active.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, DynCapability>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own name, replacing any previous one.
    pub fn register(&mut self, capability: impl Capability + 'static) {
        let name = capability.name().to_string();
        if self
            .capabilities
            .insert(name.clone(), DynCapability::new(capability))
            .is_some()
        {
            tracing::debug!(capability = %name, "Replaced registered capability");
        }
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&RunState, &Config) -> Result<StepOutput> + Send + Sync + 'static,
    {
        self.register(FnCapability::new(name, func));
    }

    pub fn get(&self, name: &str) -> Option<&DynCapability> {
        self.capabilities.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.capabilities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn remove(&mut self, name: &str) -> Option<DynCapability> {
        self.capabilities.remove(name)
    }

    pub fn clear(&mut self) {
        self.capabilities.clear();
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
