//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on malformed values. The result is
//! passed explicitly into the span log, watchers and runners; nothing reads
//! the environment after this.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::RunnerConfig;
use crate::error::{Error, Result};
use crate::span_log::LogConfig;
use crate::telemetry::TelemetryConfig;
use crate::watcher::WatchConfig;

pub const DEFAULT_LOG_PATH: &str = "telemetry_spans.jsonl";

#[derive(Debug, Clone)]
pub struct Config {
    pub log: LogConfig,
    pub watch: WatchConfig,
    pub runner: RunnerConfig,
    /// Roster file; the built-in roster when unset.
    pub agents_file: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = WatchConfig::default();
        let runner_defaults = RunnerConfig::default();

        let log = LogConfig {
            path: var("SWARMSH_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH)),
            sync_on_append: parsed(&var, "SWARMSH_SYNC_APPEND")?.unwrap_or(true),
        };

        let watch = WatchConfig {
            poll_min: parsed(&var, "SWARMSH_POLL_MIN_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_min),
            poll_max: parsed(&var, "SWARMSH_POLL_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_max),
        };
        if watch.poll_min.is_zero() || watch.poll_min > watch.poll_max {
            return Err(Error::Config(format!(
                "poll interval must satisfy 0 < min <= max, got {:?}..{:?}",
                watch.poll_min, watch.poll_max
            )));
        }

        let runner = RunnerConfig {
            max_effect_attempts: parsed(&var, "SWARMSH_MAX_EFFECT_ATTEMPTS")?
                .unwrap_or(runner_defaults.max_effect_attempts),
            emit_transition_spans: parsed(&var, "SWARMSH_TRANSITION_SPANS")?
                .unwrap_or(runner_defaults.emit_transition_spans),
            checkpoint_dir: var("SWARMSH_CHECKPOINT_DIR").map(PathBuf::from),
            ..runner_defaults
        };
        if runner.max_effect_attempts == 0 {
            return Err(Error::Config(
                "SWARMSH_MAX_EFFECT_ATTEMPTS must be at least 1".into(),
            ));
        }

        Ok(Self {
            log,
            watch,
            runner,
            agents_file: var("SWARMSH_AGENTS").map(PathBuf::from),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Telemetry settings for [`crate::telemetry::init_telemetry`].
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            log_level: self.log_level.clone(),
            ..TelemetryConfig::default()
        }
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}")))
        })
        .transpose()
}
