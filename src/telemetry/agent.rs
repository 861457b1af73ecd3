//! Agent processing span helpers.
//!
//! Provides span creation and transition recording for spans flowing
//! through an agent's run loop.

use tracing::Span;

/// Start a span for one agent consuming one log entry.
///
/// The `swarm.agent.state` field is declared empty and is filled in by
/// [`record_transition`].
pub fn start_processing_span(agent: &str, agent_type: &str, span_name: &str) -> Span {
    tracing::info_span!(
        "swarm.agent.process",
        "swarm.agent" = agent,
        "swarm.agent.type" = agent_type,
        "swarm.span.name" = span_name,
        "swarm.agent.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
pub fn record_transition(span: &Span, from: &str, to: &str, trigger: &str) {
    span.record("swarm.agent.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, trigger = trigger, "state_transition");
    });
}
