//! Agent FSM runtime.
//!
//! Applying a span is split in two so the runner can append cascades before
//! the state moves:
//!
//! 1. [`Agent::decide`] is pure. It looks up the transition, runs the guard
//!    and effect, and materializes outbound spans.
//! 2. [`Agent::commit`] applies the decision: new state, context updates,
//!    and the span's fingerprint recorded as processed.
//!
//! [`Agent::apply`] does both, for replays and tests.
//!
//! Spans read from the log are offered with their position
//! ([`Agent::decide_at`], [`Agent::apply_at`]) so records without a span id
//! are told apart by where they sit, not by their content.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::table::{Context, EffectError, EffectInput, Effects, TransitionTable};
use crate::emitter::cascade_span;
use crate::error::{Error, Result};
use crate::model::{Span, TRANSITION_SPAN};

/// Outcome of offering one span to one agent.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// State moved (possibly to itself) and the effect ran.
    Applied {
        from: &'static str,
        to: &'static str,
        trigger: String,
        emitted: Vec<Span>,
    },
    /// No transition from the current state for this span. Not an error.
    NoMatch,
    /// A transition matched but its guard failed. State unchanged.
    GuardRejected {
        state: &'static str,
        trigger: String,
        emitted: Vec<Span>,
    },
    /// This span was already applied.
    Duplicate,
    /// The effect failed. State unchanged; safe to retry.
    EffectFailed {
        state: &'static str,
        trigger: String,
        error: EffectError,
    },
}

impl TransitionResult {
    pub fn emitted(&self) -> &[Span] {
        match self {
            Self::Applied { emitted, .. } | Self::GuardRejected { emitted, .. } => emitted.as_slice(),
            _ => &[],
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// A computed but not yet applied outcome. See [`Agent::decide`].
#[derive(Debug)]
pub enum Decision {
    NoMatch,
    Duplicate,
    Fire {
        fingerprint: String,
        from: &'static str,
        to: &'static str,
        trigger: String,
        emitted: Vec<Span>,
        updates: Vec<(String, Value)>,
    },
    Reject {
        fingerprint: String,
        state: &'static str,
        trigger: String,
        emitted: Vec<Span>,
    },
    Fail {
        state: &'static str,
        trigger: String,
        error: EffectError,
    },
}

impl Decision {
    /// Spans that must be on the log before this decision is committed.
    pub fn outbound(&self) -> &[Span] {
        match self {
            Self::Fire { emitted, .. } | Self::Reject { emitted, .. } => emitted.as_slice(),
            _ => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// One FSM instance.
#[derive(Debug, Clone)]
pub struct Agent {
    id: String,
    table: Arc<TransitionTable>,
    state: &'static str,
    context: Context,
    processed: HashSet<String>,
}

impl Agent {
    /// New agent in its type's initial state.
    pub fn new(id: impl Into<String>, table: Arc<TransitionTable>) -> Self {
        Self {
            id: id.into(),
            state: table.initial(),
            table,
            context: Context::new(),
            processed: HashSet::new(),
        }
    }

    /// Seed the context, e.g. with roster parameters.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context.extend(context);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_type(&self) -> &str {
        self.table.agent_type()
    }

    pub fn state(&self) -> &'static str {
        self.state
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn table(&self) -> &Arc<TransitionTable> {
        &self.table
    }

    pub fn is_terminal(&self) -> bool {
        self.table.is_terminal(self.state)
    }

    /// Number of spans this agent has matched (applied or rejected).
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Work out what `span` would do to this agent without changing it.
    pub fn decide(&self, span: &Span) -> Decision {
        self.decide_as(span, span.fingerprint())
    }

    /// [`decide`](Self::decide) for a span read from the log at `position`.
    pub fn decide_at(&self, span: &Span, position: u64) -> Decision {
        self.decide_as(span, span.fingerprint_at(position))
    }

    fn decide_as(&self, span: &Span, fingerprint: String) -> Decision {
        if span.name == TRANSITION_SPAN || !self.table.listens_to(&span.name) {
            return Decision::NoMatch;
        }

        let trigger = span.trigger();
        let Some(transition) = self.table.lookup(self.state, trigger) else {
            return Decision::NoMatch;
        };

        if self.processed.contains(&fingerprint) {
            return Decision::Duplicate;
        }

        let input = EffectInput {
            agent_id: &self.id,
            fingerprint: &fingerprint,
            from: transition.from,
            to: transition.to,
            span,
            context: &self.context,
        };

        let passed = transition.guard.is_none_or(|guard| guard(span, &self.context));
        if !passed {
            let emitted = match transition.on_reject.map(|effect| effect(&input)) {
                Some(Ok(effects)) => self.materialize(span, &fingerprint, &effects),
                Some(Err(e)) => {
                    warn!(agent = %self.id, state = self.state, trigger, "rejection effect failed: {e}");
                    Vec::new()
                }
                None => Vec::new(),
            };
            return Decision::Reject {
                fingerprint,
                state: self.state,
                trigger: trigger.to_string(),
                emitted,
            };
        }

        let effects = match transition.effect.map(|effect| effect(&input)) {
            Some(Ok(effects)) => effects,
            Some(Err(error)) => {
                return Decision::Fail {
                    state: self.state,
                    trigger: trigger.to_string(),
                    error,
                };
            }
            None => Effects::none(),
        };

        Decision::Fire {
            emitted: self.materialize(span, &fingerprint, &effects),
            fingerprint,
            from: transition.from,
            to: transition.to,
            trigger: trigger.to_string(),
            updates: effects.context,
        }
    }

    /// Apply a decision produced by [`decide`](Self::decide) on this agent.
    pub fn commit(&mut self, decision: Decision) -> TransitionResult {
        match decision {
            Decision::NoMatch => TransitionResult::NoMatch,
            Decision::Duplicate => TransitionResult::Duplicate,
            Decision::Fire {
                fingerprint,
                from,
                to,
                trigger,
                emitted,
                updates,
            } => {
                self.state = to;
                self.context.extend(updates);
                self.processed.insert(fingerprint);
                debug!(agent = %self.id, from, to, %trigger, "transition applied");
                TransitionResult::Applied {
                    from,
                    to,
                    trigger,
                    emitted,
                }
            }
            Decision::Reject {
                fingerprint,
                state,
                trigger,
                emitted,
            } => {
                self.processed.insert(fingerprint);
                debug!(agent = %self.id, state, %trigger, "guard rejected");
                TransitionResult::GuardRejected {
                    state,
                    trigger,
                    emitted,
                }
            }
            Decision::Fail {
                state,
                trigger,
                error,
            } => TransitionResult::EffectFailed {
                state,
                trigger,
                error,
            },
        }
    }

    /// Decide and commit in one step. Outbound spans are returned in the
    /// result, not appended anywhere.
    pub fn apply(&mut self, span: &Span) -> TransitionResult {
        let decision = self.decide(span);
        self.commit(decision)
    }

    /// [`apply`](Self::apply) for a span read from the log at `position`.
    pub fn apply_at(&mut self, span: &Span, position: u64) -> TransitionResult {
        let decision = self.decide_at(span, position);
        self.commit(decision)
    }

    fn materialize(&self, span: &Span, fingerprint: &str, effects: &Effects) -> Vec<Span> {
        effects
            .spans
            .iter()
            .enumerate()
            .map(|(index, outbound)| cascade_span(&self.id, span, fingerprint, index, outbound))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Capture everything needed to resume at log offset `offset`.
    pub fn snapshot(&self, offset: u64) -> AgentSnapshot {
        let mut processed: Vec<String> = self.processed.iter().cloned().collect();
        processed.sort();
        AgentSnapshot {
            id: self.id.clone(),
            agent_type: self.agent_type().to_string(),
            state: self.state.to_string(),
            context: self.context.clone(),
            processed,
            offset,
        }
    }

    /// Rebuild an agent from a snapshot taken of the same agent type.
    pub fn restore(table: Arc<TransitionTable>, snapshot: AgentSnapshot) -> Result<Self> {
        if snapshot.agent_type != table.agent_type() {
            return Err(Error::Other(format!(
                "snapshot of {} is for agent type {}, not {}",
                snapshot.id,
                snapshot.agent_type,
                table.agent_type()
            )));
        }
        let state = table.state(&snapshot.state).ok_or_else(|| {
            Error::Other(format!(
                "snapshot of {} names unknown state {}",
                snapshot.id, snapshot.state
            ))
        })?;

        Ok(Self {
            id: snapshot.id,
            table,
            state,
            context: snapshot.context,
            processed: snapshot.processed.into_iter().collect(),
        })
    }
}

/// Serializable agent state plus the log offset it corresponds to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub agent_type: String,
    pub state: String,
    pub context: Context,
    pub processed: Vec<String>,
    pub offset: u64,
}
