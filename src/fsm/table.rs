//! Data-driven transition tables.
//!
//! A table maps `(state, trigger)` to exactly one [`Transition`]. Guards and
//! effects are plain function pointers, so a table is immutable data that
//! every agent of the type shares behind an `Arc`.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::model::{Attributes, Span};

/// Agent-held context: tallies, identifiers, parameters.
pub type Context = Attributes;

/// Predicate over the incoming span and the agent's context.
pub type Guard = fn(&Span, &Context) -> bool;

/// Side effect of a transition. Must be a pure function of its input so a
/// replay produces the same outbound spans.
pub type Effect = fn(&EffectInput<'_>) -> EffectResult;

/// Outcome of running an effect.
pub type EffectResult = std::result::Result<Effects, EffectError>;

/// Everything an effect may look at.
pub struct EffectInput<'a> {
    pub agent_id: &'a str,
    /// Idempotence key of the triggering span.
    pub fingerprint: &'a str,
    pub from: &'static str,
    pub to: &'static str,
    pub span: &'a Span,
    pub context: &'a Context,
}

/// A failed effect. The transition is not applied.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct EffectError(pub String);

/// A span an effect wants appended. The emitter fills in trace, ids, time
/// and the producing agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub name: String,
    pub trigger: String,
    pub attributes: Attributes,
}

impl Outbound {
    pub fn new(name: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger: trigger.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// What an effect produced: spans to emit and context updates to apply
/// together with the state change.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Effects {
    pub spans: Vec<Outbound>,
    pub context: Vec<(String, Value)>,
}

impl Effects {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(mut self, span: Outbound) -> Self {
        self.spans.push(span);
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    /// Set `key` only when `value` is present.
    pub fn set_opt(self, key: impl Into<String>, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.set(key, value),
            None => self,
        }
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// `(from, trigger) -> (to, guard?, effect?)`.
#[derive(Clone)]
pub struct Transition {
    pub from: &'static str,
    pub trigger: &'static str,
    pub to: &'static str,
    pub guard: Option<Guard>,
    pub effect: Option<Effect>,
    /// Runs when the guard fails, to record the rejection.
    pub on_reject: Option<Effect>,
}

impl Transition {
    pub fn new(from: &'static str, trigger: &'static str, to: &'static str) -> Self {
        Self {
            from,
            trigger,
            to,
            guard: None,
            effect: None,
            on_reject: None,
        }
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect);
        self
    }

    pub fn on_reject(mut self, effect: Effect) -> Self {
        self.on_reject = Some(effect);
        self
    }
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("from", &self.from)
            .field("trigger", &self.trigger)
            .field("to", &self.to)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// The full state machine of one agent type.
#[derive(Debug)]
pub struct TransitionTable {
    agent_type: String,
    initial: &'static str,
    states: Vec<&'static str>,
    terminal: Vec<&'static str>,
    listen_prefix: Option<String>,
    transitions: HashMap<&'static str, HashMap<&'static str, Transition>>,
}

impl TransitionTable {
    pub fn builder(
        agent_type: impl Into<String>,
        states: &[&'static str],
        initial: &'static str,
    ) -> TableBuilder {
        TableBuilder {
            agent_type: agent_type.into(),
            initial,
            states: states.to_vec(),
            terminal: Vec::new(),
            listen_prefix: None,
            transitions: Vec::new(),
        }
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn initial(&self) -> &'static str {
        self.initial
    }

    pub fn states(&self) -> &[&'static str] {
        &self.states
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal.iter().any(|s| *s == state)
    }

    /// Canonical `'static` name for a state, if the table defines it.
    pub fn state(&self, name: &str) -> Option<&'static str> {
        self.states.iter().copied().find(|s| *s == name)
    }

    /// Whether spans with this name are addressed to this agent type at all.
    pub fn listens_to(&self, span_name: &str) -> bool {
        self.listen_prefix
            .as_deref()
            .is_none_or(|prefix| span_name.starts_with(prefix))
    }

    pub fn lookup(&self, state: &str, trigger: &str) -> Option<&Transition> {
        self.transitions.get(state)?.get(trigger)
    }

    /// Every transition, for listing.
    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.values().flat_map(HashMap::values)
    }
}

/// Builder for [`TransitionTable`]; `build` enforces determinism.
pub struct TableBuilder {
    agent_type: String,
    initial: &'static str,
    states: Vec<&'static str>,
    terminal: Vec<&'static str>,
    listen_prefix: Option<String>,
    transitions: Vec<Transition>,
}

impl TableBuilder {
    pub fn terminal(mut self, states: &[&'static str]) -> Self {
        self.terminal.extend_from_slice(states);
        self
    }

    /// Only spans whose name starts with `prefix` are considered.
    pub fn listen(mut self, prefix: impl Into<String>) -> Self {
        self.listen_prefix = Some(prefix.into());
        self
    }

    pub fn transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn build(self) -> Result<TransitionTable> {
        let known = |state: &str| self.states.iter().any(|s| *s == state);

        for state in std::iter::once(&self.initial).chain(&self.terminal) {
            if !known(state) {
                return Err(Error::Config(format!(
                    "agent type {} names undeclared state {state}",
                    self.agent_type
                )));
            }
        }

        let mut transitions: HashMap<&'static str, HashMap<&'static str, Transition>> =
            HashMap::new();
        for t in &self.transitions {
            for state in [t.from, t.to] {
                if !known(state) {
                    return Err(Error::Config(format!(
                        "agent type {} transition {} --{}--> {} uses undeclared state {state}",
                        self.agent_type, t.from, t.trigger, t.to
                    )));
                }
            }
            let by_trigger = transitions.entry(t.from).or_default();
            if by_trigger.insert(t.trigger, t.clone()).is_some() {
                return Err(Error::DuplicateTransition {
                    agent_type: self.agent_type.clone(),
                    state: t.from.to_string(),
                    trigger: t.trigger.to_string(),
                });
            }
        }

        Ok(TransitionTable {
            agent_type: self.agent_type,
            initial: self.initial,
            states: self.states,
            terminal: self.terminal,
            listen_prefix: self.listen_prefix,
            transitions,
        })
    }
}
