//! Core data model.
//!
//! A span is one observed event on the shared log. It has a dot-namespaced
//! name (the routing key), a trace it belongs to, and an open attribute map
//! carrying domain data.

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Attribute key naming the agent that produced a span.
pub const ATTR_AGENT: &str = "swarm.agent";
/// Attribute key carrying the trigger keyword used for transition lookup.
pub const ATTR_TRIGGER: &str = "swarm.trigger";
/// Fallback trigger key used by hand-written seed spans.
pub const ATTR_TRIGGER_SHORT: &str = "trigger";

/// Name of the record a runner appends for every applied transition.
/// Agents never route these.
pub const TRANSITION_SPAN: &str = "swarm.agent.transition";

/// Namespace for deterministic span ids and content fingerprints.
const SPAN_NAMESPACE: Uuid = Uuid::from_u128(0x5ea7_9c1e_4d2b_4f8a_9b7e_3c1d_2a6f_8e01);

/// Open attribute map. Ordered so that serialization is canonical.
pub type Attributes = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Span
// ---------------------------------------------------------------------------

/// An immutable event record. Once appended to the log it is never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Dot-namespaced event kind, e.g. `swarmsh.roberts.open`.
    pub name: String,

    /// Correlates spans belonging to one workflow instance.
    pub trace_id: String,

    /// Unique id; the idempotence key when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    /// Span that caused this one, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    /// Creation time, serialized as fractional epoch seconds.
    #[serde(default, with = "epoch_seconds", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    pub attributes: Attributes,

    /// Top-level keys this crate does not model (`status`, `events`, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Span {
    /// Start building a span with a fresh span id and the current time.
    pub fn builder(name: impl Into<String>, trace_id: impl Into<String>) -> SpanBuilder {
        SpanBuilder::new(name, trace_id)
    }

    /// Parse one log line.
    pub fn from_json_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// Serialize as a single log line (without the trailing newline).
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Trigger keyword: `swarm.trigger`, then `trigger`, then the last
    /// segment of the name.
    pub fn trigger(&self) -> &str {
        [ATTR_TRIGGER, ATTR_TRIGGER_SHORT]
            .iter()
            .find_map(|key| self.attributes.get(*key).and_then(Value::as_str))
            .unwrap_or_else(|| self.name.rsplit('.').next().unwrap_or(&self.name))
    }

    /// The producing agent, if recorded.
    pub fn agent(&self) -> Option<&str> {
        self.attr_str(ATTR_AGENT)
    }

    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Numeric attribute. Accepts JSON numbers and numeric strings, since
    /// CLI-produced spans often carry everything as text.
    pub fn attr_f64(&self, key: &str) -> Option<f64> {
        match self.attributes.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean attribute. Accepts `true`/`false` and their string forms.
    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        match self.attributes.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String form of a scalar attribute (numbers are rendered).
    pub fn attr_text(&self, key: &str) -> Option<String> {
        match self.attributes.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Idempotence key for a span read from the log at `position`: the span
    /// id, or the position itself. Two identical records without ids are
    /// two deliveries.
    pub fn fingerprint_at(&self, position: u64) -> String {
        match &self.span_id {
            Some(id) => id.clone(),
            None => format!("log@{position}"),
        }
    }

    /// Idempotence key for a span with no log position: the span id, or a
    /// UUIDv5 of the canonical JSON when the producer did not assign one.
    pub fn fingerprint(&self) -> String {
        match &self.span_id {
            Some(id) => id.clone(),
            None => {
                let canonical = serde_json::to_vec(self).unwrap_or_default();
                Uuid::new_v5(&SPAN_NAMESPACE, &canonical).to_string()
            }
        }
    }
}

/// Fresh trace id for a new workflow instance.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Deterministic span id derived from its parts. Replays of the same
/// effect produce the same id, which is what lets the log drop duplicates.
pub fn derived_span_id(parts: &[&str]) -> String {
    Uuid::new_v5(&SPAN_NAMESPACE, parts.join("\u{1f}").as_bytes())
        .simple()
        .to_string()
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for spans. Used by the emitter, the orchestrator and tests.
pub struct SpanBuilder {
    span: Span,
}

impl SpanBuilder {
    pub fn new(name: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            span: Span {
                name: name.into(),
                trace_id: trace_id.into(),
                span_id: Some(Uuid::new_v4().simple().to_string()),
                parent_span_id: None,
                // Microseconds is what the wire format carries.
                timestamp: Some(Utc::now().trunc_subsecs(6)),
                attributes: Attributes::new(),
                extra: BTreeMap::new(),
            },
        }
    }

    pub fn span_id(mut self, id: impl Into<String>) -> Self {
        self.span.span_id = Some(id.into());
        self
    }

    /// Leave the span id unset, as hand-written seed lines often do.
    pub fn without_span_id(mut self) -> Self {
        self.span.span_id = None;
        self
    }

    pub fn parent(mut self, parent_span_id: Option<String>) -> Self {
        self.span.parent_span_id = parent_span_id;
        self
    }

    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.span.timestamp = Some(at);
        self
    }

    pub fn agent(self, agent: impl Into<String>) -> Self {
        self.attr(ATTR_AGENT, agent.into())
    }

    pub fn trigger(self, trigger: impl Into<String>) -> Self {
        self.attr(ATTR_TRIGGER, trigger.into())
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.span.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attrs(mut self, attributes: Attributes) -> Self {
        self.span.attributes.extend(attributes);
        self
    }

    pub fn build(self) -> Span {
        self.span
    }
}

// ---------------------------------------------------------------------------
// Timestamp encoding
// ---------------------------------------------------------------------------

/// `Option<DateTime<Utc>>` as fractional seconds since the Unix epoch,
/// e.g. `1750925873.0`.
mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => {
                let secs = at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1e6;
                serializer.serialize_f64(secs)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs.and_then(|secs| {
            let whole = secs.floor();
            let micros = ((secs - whole) * 1e6).round() as i64;
            DateTime::from_timestamp(whole as i64, 0)
                .map(|at| at + chrono::Duration::microseconds(micros))
        }))
    }
}
