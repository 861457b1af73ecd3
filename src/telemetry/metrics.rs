//! Metric instrument factories for swarmsh.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"swarmsh"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for swarmsh instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("swarmsh")
}

/// Counter: spans written to the log.
pub fn spans_appended() -> Counter<u64> {
    meter()
        .u64_counter("swarmsh.log.spans_appended")
        .with_description("Number of spans appended to the span log")
        .build()
}

/// Counter: cascade spans dropped because their id was already logged.
pub fn spans_deduplicated() -> Counter<u64> {
    meter()
        .u64_counter("swarmsh.log.spans_deduplicated")
        .with_description("Number of spans skipped as already on the log")
        .build()
}

/// Counter: malformed log lines skipped by readers.
pub fn parse_errors() -> Counter<u64> {
    meter()
        .u64_counter("swarmsh.log.parse_errors")
        .with_description("Number of malformed span records skipped")
        .build()
}

/// Counter: applied agent transitions.
/// Labels: `agent_type`, `from`, `to`.
pub fn transitions() -> Counter<u64> {
    meter()
        .u64_counter("swarmsh.agent.transitions")
        .with_description("Number of applied agent state transitions")
        .build()
}

/// Counter: matched transitions whose guard failed.
/// Labels: `agent_type`, `state`, `trigger`.
pub fn guard_rejections() -> Counter<u64> {
    meter()
        .u64_counter("swarmsh.agent.guard_rejections")
        .with_description("Number of transitions rejected by their guard")
        .build()
}

/// Counter: failed effect invocations.
/// Labels: `agent_type`, `state`, `trigger`.
pub fn effect_failures() -> Counter<u64> {
    meter()
        .u64_counter("swarmsh.agent.effect_failures")
        .with_description("Number of failed transition effects")
        .build()
}

/// Histogram: time to process one span, in milliseconds.
/// Labels: `agent_type`, `outcome`.
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("swarmsh.agent.processing_duration_ms")
        .with_description("Span processing duration in milliseconds")
        .with_unit("ms")
        .build()
}
