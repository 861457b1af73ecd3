//! Delivery agent running a Scrum sprint.
//!
//! `PLANNING --plan--> EXECUTING --review--> REVIEW --retro--> RETRO`,
//! plus `EXECUTING --daily--> EXECUTING` for stand-ups.
//!
//! The review records the sprint's defect rate. Within the threshold it
//! proceeds by emitting `swarmsh.scrum.retro` to itself; above it, it emits
//! `swarmsh.lean.define` instead and the retro guard holds the sprint in
//! `REVIEW`.

use serde_json::Value;

use crate::error::Result;
use crate::fsm::{
    Context, EffectError, EffectInput, EffectResult, Effects, Outbound, Transition, TransitionTable, ctx_f64,
    ctx_str,
};
use crate::model::Span;

pub const AGENT_TYPE: &str = "scrum";

pub const PLANNING: &str = "PLANNING";
pub const EXECUTING: &str = "EXECUTING";
pub const REVIEW: &str = "REVIEW";
pub const RETRO: &str = "RETRO";

/// Context key for the quality gate; overridable per agent via roster params.
pub const DEFECT_THRESHOLD: &str = "defect_threshold";
pub const DEFAULT_DEFECT_THRESHOLD: f64 = 3.0;

pub fn table() -> Result<TransitionTable> {
    TransitionTable::builder(AGENT_TYPE, &[PLANNING, EXECUTING, REVIEW, RETRO], PLANNING)
        .listen("swarmsh.scrum.")
        .terminal(&[RETRO])
        .transition(Transition::new(PLANNING, "plan", EXECUTING).effect(plan_sprint))
        .transition(Transition::new(EXECUTING, "daily", EXECUTING).effect(daily_standup))
        .transition(
            Transition::new(EXECUTING, "review", REVIEW)
                .guard(has_defect_rate)
                .effect(sprint_review),
        )
        .transition(Transition::new(REVIEW, "retro", RETRO).guard(quality_within_threshold))
        .build()
}

fn threshold(context: &Context) -> f64 {
    ctx_f64(context, DEFECT_THRESHOLD).unwrap_or(DEFAULT_DEFECT_THRESHOLD)
}

fn sprint_number(input: &EffectInput<'_>) -> Option<String> {
    input
        .span
        .attr_text("sprint_number")
        .or_else(|| ctx_str(input.context, "sprint_number").map(str::to_string))
}

fn plan_sprint(input: &EffectInput<'_>) -> EffectResult {
    let span = input.span;
    Ok(Effects::none()
        .set_opt("sprint_number", span.attr_text("sprint_number"))
        .set_opt("team_id", span.attr_text("team_id"))
        .set_opt("capacity", span.attr_f64("capacity"))
        .set_opt("motion_id", span.attr_text("motion_id")))
}

fn daily_standup(input: &EffectInput<'_>) -> EffectResult {
    let blockers: Vec<Value> = match input.span.attr("blockers") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![Value::String(s.clone())],
        _ => Vec::new(),
    };
    if blockers.is_empty() {
        return Ok(Effects::none());
    }

    let mut escalate =
        Outbound::new("swarmsh.scrum.escalate", "escalate").attr("blockers", blockers);
    if let Some(sprint) = sprint_number(input) {
        escalate = escalate.attr("sprint_number", sprint);
    }
    Ok(Effects::none().emit(escalate))
}

fn has_defect_rate(span: &Span, _context: &Context) -> bool {
    span.attr_f64("defect_rate").is_some()
}

fn sprint_review(input: &EffectInput<'_>) -> EffectResult {
    let span = input.span;
    let rate = span
        .attr_f64("defect_rate")
        .ok_or_else(|| EffectError("review span has no defect_rate".into()))?;
    let limit = threshold(input.context);
    let sprint = sprint_number(input).unwrap_or_else(|| "unknown".into());

    let effects = Effects::none()
        .set("defect_rate", rate)
        .set("sprint_number", sprint.clone())
        .set_opt("velocity", span.attr_f64("velocity"))
        .set_opt("customer_satisfaction", span.attr_f64("customer_satisfaction"));

    let next = if rate > limit {
        Outbound::new("swarmsh.lean.define", "define")
            .attr("project_id", format!("defect-sprint{sprint}"))
            .attr(
                "problem_statement",
                format!("Defect rate {rate}% exceeds {limit}% threshold"),
            )
            .attr("sponsor", input.agent_id)
            .attr("sprint_number", sprint)
            .attr("defect_rate", rate)
    } else {
        Outbound::new("swarmsh.scrum.retro", "retro").attr("sprint_number", sprint)
    };

    Ok(effects.emit(next))
}

fn quality_within_threshold(_span: &Span, context: &Context) -> bool {
    ctx_f64(context, "defect_rate").is_some_and(|rate| rate <= threshold(context))
}
