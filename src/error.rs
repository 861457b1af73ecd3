//! Error types for swarmsh.
//!
//! Routing outcomes (no match, guard rejection, duplicate delivery) are not
//! errors; see [`crate::fsm::TransitionResult`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Underlying log storage is unavailable or failed mid-operation.
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A log line that is not a valid span record.
    #[error("malformed span at offset {position}: {reason}")]
    Parse { position: u64, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("scenario {scenario} requires agents that are not running: {missing:?}")]
    MissingAgents {
        scenario: String,
        missing: Vec<String>,
    },

    #[error("agent type {agent_type} defines {state} --{trigger}--> more than once")]
    DuplicateTransition {
        agent_type: String,
        state: String,
        trigger: String,
    },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
