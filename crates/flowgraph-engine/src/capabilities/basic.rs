use async_trait::async_trait;
use serde_json::{Number, Value};

use flowgraph_types::{FlowError, Result, RunState};

use crate::definition::Config;
use crate::registry::{Capability, StepOutput};

fn config_key<'a>(config: &'a Config, default: &'a str) -> &'a str {
    config.get("key").and_then(Value::as_str).unwrap_or(default)
}

fn config_number(config: &Config, name: &str, default: i64) -> Result<Value> {
    match config.get(name) {
        None => Ok(Value::from(default)),
        Some(v @ Value::Number(_)) => Ok(v.clone()),
        Some(other) => Err(FlowError::capability(format!(
            "config '{name}' must be a number, got {other}"
        ))),
    }
}

/// The current numeric value under `key`; absent keys count as zero.
fn current_number(state: &RunState, key: &str) -> Result<Value> {
    match state.get(key) {
        None | Some(Value::Null) => Ok(Value::from(0)),
        Some(v @ Value::Number(_)) => Ok(v.clone()),
        Some(other) => Err(FlowError::capability(format!(
            "state '{key}' must be a number, got {other}"
        ))),
    }
}

/// Integer arithmetic when both sides are integers and the result fits,
/// float otherwise.
fn combine(
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(n) = int_op(x, y) {
            return Ok(Value::from(n));
        }
    }
    let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
    Number::from_f64(float_op(x, y))
        .map(Value::Number)
        .ok_or_else(|| FlowError::capability("arithmetic produced a non-finite number"))
}

// ---------------------------------------------------------------------------
// set: merge static configuration into state
// ---------------------------------------------------------------------------

pub struct SetCapability;

#[async_trait]
impl Capability for SetCapability {
    fn name(&self) -> &str {
        "set"
    }

    async fn invoke(&self, _state: &RunState, config: &Config) -> Result<StepOutput> {
        Ok(StepOutput::Merge(config.clone()))
    }
}

// ---------------------------------------------------------------------------
// increment: state[key] += by
// ---------------------------------------------------------------------------

pub struct IncrementCapability;

#[async_trait]
impl Capability for IncrementCapability {
    fn name(&self) -> &str {
        "increment"
    }

    async fn invoke(&self, state: &RunState, config: &Config) -> Result<StepOutput> {
        let key = config_key(config, "counter");
        let by = config_number(config, "by", 1)?;
        let value = combine(&current_number(state, key)?, &by, i64::checked_add, |a, b| a + b)?;
        tracing::debug!(key = %key, value = %value, "Incremented");
        Ok(StepOutput::set(key, value))
    }
}

// ---------------------------------------------------------------------------
// multiply: state[key] *= factor
// ---------------------------------------------------------------------------

pub struct MultiplyCapability;

#[async_trait]
impl Capability for MultiplyCapability {
    fn name(&self) -> &str {
        "multiply"
    }

    async fn invoke(&self, state: &RunState, config: &Config) -> Result<StepOutput> {
        let key = config_key(config, "counter");
        let factor = config_number(config, "factor", 2)?;
        let value = combine(&current_number(state, key)?, &factor, i64::checked_mul, |a, b| a * b)?;
        tracing::debug!(key = %key, value = %value, "Multiplied");
        Ok(StepOutput::set(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> Config {
        value.as_object().cloned().unwrap_or_default()
    }

    fn state(value: Value) -> RunState {
        RunState::try_from(value).unwrap()
    }

    #[tokio::test]
    async fn increment_defaults_to_counter_by_one() {
        let out = IncrementCapability
            .invoke(&state(json!({"counter": 5})), &Config::new())
            .await
            .unwrap();
        assert_eq!(out, StepOutput::set("counter", json!(6)));
    }

    #[tokio::test]
    async fn increment_missing_key_starts_at_zero() {
        let out = IncrementCapability
            .invoke(&RunState::new(), &config(json!({"key": "hits", "by": 3})))
            .await
            .unwrap();
        assert_eq!(out, StepOutput::set("hits", json!(3)));
    }

    #[tokio::test]
    async fn increment_by_float() {
        let out = IncrementCapability
            .invoke(&state(json!({"counter": 1})), &config(json!({"by": 0.5})))
            .await
            .unwrap();
        assert_eq!(out, StepOutput::set("counter", json!(1.5)));
    }

    #[tokio::test]
    async fn multiply_defaults_to_doubling() {
        let out = MultiplyCapability
            .invoke(&state(json!({"counter": 6})), &Config::new())
            .await
            .unwrap();
        assert_eq!(out, StepOutput::set("counter", json!(12)));
    }

    #[tokio::test]
    async fn multiply_rejects_non_numeric_state() {
        let err = MultiplyCapability
            .invoke(&state(json!({"counter": "six"})), &Config::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must be a number"));
    }

    #[tokio::test]
    async fn overflow_falls_back_to_float() {
        let out = MultiplyCapability
            .invoke(&state(json!({"counter": i64::MAX})), &Config::new())
            .await
            .unwrap();
        match out {
            StepOutput::Merge(m) => assert!(m["counter"].is_f64()),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn set_merges_config() {
        let out = SetCapability
            .invoke(&RunState::new(), &config(json!({"mode": "fast", "retries": 2})))
            .await
            .unwrap();
        assert_eq!(out, StepOutput::Merge(config(json!({"mode": "fast", "retries": 2}))));
    }
}
