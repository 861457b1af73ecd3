//! Finite-state-machine core: transition tables and the agent runtime.

pub mod agent;
pub mod table;

pub use agent::{Agent, AgentSnapshot, Decision, TransitionResult};
pub use table::{
    Context, Effect, EffectError, EffectInput, EffectResult, Effects, Guard, Outbound, Transition,
    TransitionTable,
};

use serde_json::Value;

/// Numeric context value. Accepts numbers and numeric strings.
pub fn ctx_f64(context: &Context, key: &str) -> Option<f64> {
    match context.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// String context value.
pub fn ctx_str<'a>(context: &'a Context, key: &str) -> Option<&'a str> {
    context.get(key).and_then(Value::as_str)
}
