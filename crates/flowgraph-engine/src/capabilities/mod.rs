//! Built-in capabilities.

pub mod basic;
pub mod code_review;

pub use basic::{IncrementCapability, MultiplyCapability, SetCapability};
pub use code_review::{code_review_graph, SourceScanner};

use flowgraph_types::Result;

use crate::registry::CapabilityRegistry;

/// A registry holding every built-in capability.
pub fn default_registry() -> Result<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();
    registry.register(SetCapability);
    registry.register(IncrementCapability);
    registry.register(MultiplyCapability);
    code_review::register(&mut registry)?;
    tracing::debug!(capabilities = registry.len(), "Built default registry");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_all_builtins() {
        let registry = default_registry().unwrap();
        assert_eq!(
            registry.names(),
            [
                "check_complexity",
                "detect_issues",
                "extract_functions",
                "increment",
                "multiply",
                "set",
                "suggest_improvements",
            ]
        );
    }
}
