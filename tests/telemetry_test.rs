//! Integration tests for telemetry initialization and span helpers.

use swarmsh::telemetry::{TelemetryConfig, agent, init_telemetry, metrics};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so this may
    // return Err if another test got there first; that is acceptable.
    let config = TelemetryConfig {
        service_name: "swarmsh-test".to_string(),
        ..TelemetryConfig::default()
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn bad_log_level_is_a_config_error() {
    // Only reached when RUST_LOG does not override the level.
    if std::env::var("RUST_LOG").is_ok() {
        return;
    }
    let config = TelemetryConfig {
        log_level: "swarmsh=loud".to_string(),
        ..TelemetryConfig::default()
    };
    assert!(matches!(
        init_telemetry(config),
        Err(swarmsh::error::Error::Config(_))
    ));
}

#[test]
fn processing_span_records_transition() {
    let span = agent::start_processing_span("roberts", "roberts", "swarmsh.roberts.close");
    agent::record_transition(&span, "VOTING", "CLOSED", "close");
}

#[test]
fn metric_instruments_build_without_a_provider() {
    use opentelemetry::KeyValue;

    metrics::spans_appended().add(1, &[]);
    metrics::transitions().add(
        1,
        &[
            KeyValue::new("agent_type", "scrum"),
            KeyValue::new("from", "EXECUTING"),
            KeyValue::new("to", "REVIEW"),
        ],
    );
    metrics::processing_duration_ms().record(1.5, &[KeyValue::new("outcome", "applied")]);
}
