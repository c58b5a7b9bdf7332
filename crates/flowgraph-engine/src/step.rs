//! Executable units bound to graph nodes.

use flowgraph_types::{Result, RunState};

use crate::definition::Config;
use crate::registry::{DynCapability, StepOutput};

/// One node's executable binding, resolved once at compile time.
#[derive(Debug, Clone)]
pub enum Step {
    /// Invokes a registered capability with the node's static configuration.
    Capability {
        node_id: String,
        capability: DynCapability,
        config: Config,
    },
    /// Returns the state unchanged. Used for structural nodes such as joins.
    Identity { node_id: String },
}

impl Step {
    pub fn node_id(&self) -> &str {
        match self {
            Step::Capability { node_id, .. } | Step::Identity { node_id } => node_id,
        }
    }

    /// Name of the bound capability, `None` for identity steps.
    pub fn capability_name(&self) -> Option<&str> {
        match self {
            Step::Capability { capability, .. } => Some(capability.name()),
            Step::Identity { .. } => None,
        }
    }

    /// Run the step against `state`, applying the capability's output.
    ///
    /// Errors raised by the capability are returned untouched and leave
    /// `state` as it was.
    pub async fn execute(&self, state: &mut RunState) -> Result<()> {
        let Step::Capability {
            capability, config, ..
        } = self
        else {
            return Ok(());
        };
        match capability.invoke(state, config).await? {
            StepOutput::Merge(updates) => state.apply_updates(updates),
            StepOutput::Replace(replacement) => *state = replacement,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FnCapability;
    use flowgraph_types::FlowError;
    use serde_json::json;

    fn bound(func: FnCapability) -> Step {
        Step::Capability {
            node_id: "n".into(),
            capability: DynCapability::new(func),
            config: Config::new(),
        }
    }

    fn initial() -> RunState {
        RunState::try_from(json!({"a": 1, "b": 2})).unwrap()
    }

    #[tokio::test]
    async fn identity_returns_state_unchanged() {
        let step = Step::Identity {
            node_id: "join".into(),
        };
        let mut state = initial();
        step.execute(&mut state).await.unwrap();
        assert_eq!(state, initial());
        assert_eq!(step.node_id(), "join");
        assert!(step.capability_name().is_none());
    }

    #[tokio::test]
    async fn merge_keeps_untouched_keys() {
        let step = bound(FnCapability::new("m", |_, _| {
            Ok(StepOutput::set("b", json!(20)))
        }));
        let mut state = initial();
        step.execute(&mut state).await.unwrap();
        assert_eq!(serde_json::to_value(&state).unwrap(), json!({"a": 1, "b": 20}));
    }

    #[tokio::test]
    async fn replace_discards_previous_state() {
        let step = bound(FnCapability::new("r", |_, _| {
            Ok(StepOutput::Replace(
                RunState::try_from(json!({"only": true})).unwrap_or_default(),
            ))
        }));
        let mut state = initial();
        step.execute(&mut state).await.unwrap();
        assert_eq!(serde_json::to_value(&state).unwrap(), json!({"only": true}));
    }

    #[tokio::test]
    async fn config_is_passed_on_every_invocation() {
        let mut config = Config::new();
        config.insert("label".into(), json!("x"));
        let step = Step::Capability {
            node_id: "n".into(),
            capability: DynCapability::new(FnCapability::new("c", |_, config| {
                Ok(StepOutput::set("seen", config.get("label").cloned().unwrap_or_default()))
            })),
            config,
        };
        let mut state = RunState::new();
        step.execute(&mut state).await.unwrap();
        state.set("seen", json!(null));
        step.execute(&mut state).await.unwrap();
        assert_eq!(state.get("seen"), Some(&json!("x")));
        assert_eq!(step.capability_name(), Some("c"));
    }

    #[tokio::test]
    async fn capability_error_propagates_unmodified() {
        let step = bound(FnCapability::new("boom", |_, _| {
            Err(FlowError::capability("division by zero"))
        }));
        let mut state = initial();
        let err = step.execute(&mut state).await.unwrap_err();
        assert!(matches!(err, FlowError::Capability(ref m) if m == "division by zero"));
        assert_eq!(state, initial());
    }
}
