//! Span emitter: how one agent's transition becomes another agent's trigger.
//!
//! The emitter only builds well-formed spans and appends them. It neither
//! knows nor cares who consumes them.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::fsm::Outbound;
use crate::model::{Attributes, Span, derived_span_id, new_trace_id};
use crate::span_log::SpanLog;

/// Build the span an effect asked for, continuing `source`'s trace.
///
/// The id is derived from the producing agent, the source span's
/// fingerprint and the output index, so re-running the same effect yields
/// the same id and the log can drop the repeat.
pub fn cascade_span(
    agent_id: &str,
    source: &Span,
    fingerprint: &str,
    index: usize,
    outbound: &Outbound,
) -> Span {
    Span::builder(&outbound.name, &source.trace_id)
        .span_id(derived_span_id(&[
            agent_id,
            fingerprint,
            outbound.name.as_str(),
            index.to_string().as_str(),
        ]))
        .parent(source.span_id.clone())
        .attrs(outbound.attributes.clone())
        .agent(agent_id)
        .trigger(&outbound.trigger)
        .build()
}

/// Appends spans on behalf of agents and drivers.
#[derive(Clone)]
pub struct Emitter {
    log: Arc<SpanLog>,
}

impl Emitter {
    pub fn new(log: Arc<SpanLog>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &Arc<SpanLog> {
        &self.log
    }

    /// Build and append a span. With a `parent` the span joins its trace;
    /// without one it starts a fresh trace.
    pub async fn emit(
        &self,
        name: &str,
        agent_id: &str,
        trigger: &str,
        attributes: Attributes,
        parent: Option<&Span>,
    ) -> Result<Span> {
        let trace_id = parent.map_or_else(new_trace_id, |p| p.trace_id.clone());
        let span = Span::builder(name, trace_id)
            .parent(parent.and_then(|p| p.span_id.clone()))
            .attrs(attributes)
            .agent(agent_id)
            .trigger(trigger)
            .build();
        self.log.append(&span).await?;
        Ok(span)
    }

    /// Append `outbound` as a root span of an existing trace. Returns the
    /// span and its log position.
    pub async fn emit_in_trace(
        &self,
        trace_id: &str,
        agent_id: &str,
        outbound: &Outbound,
    ) -> Result<(u64, Span)> {
        let span = Span::builder(&outbound.name, trace_id)
            .attrs(outbound.attributes.clone())
            .agent(agent_id)
            .trigger(&outbound.trigger)
            .build();
        let position = self.log.append(&span).await?;
        Ok((position, span))
    }

    /// Append an already built span unless its id is already on the log.
    /// Returns whether it was appended.
    pub async fn publish(&self, span: &Span) -> Result<bool> {
        let appended = self.log.append_unique(span).await?.is_some();
        if !appended {
            debug!(span = %span.name, trace_id = %span.trace_id, "cascade already on log");
        }
        Ok(appended)
    }

    /// Publish in order, stopping at the first storage error. Returns how
    /// many spans were newly appended.
    pub async fn publish_all(&self, spans: &[Span]) -> Result<usize> {
        let mut appended = 0;
        for span in spans {
            if self.publish(span).await? {
                appended += 1;
            }
        }
        Ok(appended)
    }
}
