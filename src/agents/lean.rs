//! Improvement agent walking a Lean Six Sigma DMAIC project.
//!
//! `DEFINE -> MEASURE -> ANALYZE -> IMPROVE -> CONTROL`, each step driven by
//! the trigger named after the phase being completed. Usually started by the
//! delivery agent's quality-gate breach. A validated `control` asks
//! governance to adopt the improvement.

use crate::error::Result;
use crate::fsm::{
    Context, EffectError, EffectInput, EffectResult, Effects, Outbound, Transition, TransitionTable, ctx_str,
};
use crate::model::Span;

pub const AGENT_TYPE: &str = "lean";

pub const DEFINE: &str = "DEFINE";
pub const MEASURE: &str = "MEASURE";
pub const ANALYZE: &str = "ANALYZE";
pub const IMPROVE: &str = "IMPROVE";
pub const CONTROL: &str = "CONTROL";

pub fn table() -> Result<TransitionTable> {
    TransitionTable::builder(
        AGENT_TYPE,
        &[DEFINE, MEASURE, ANALYZE, IMPROVE, CONTROL],
        DEFINE,
    )
    .listen("swarmsh.lean.")
    .transition(
        Transition::new(DEFINE, "define", MEASURE)
            .guard(has_project)
            .effect(define_project),
    )
    .transition(Transition::new(MEASURE, "measure", ANALYZE).effect(record_phase))
    .transition(Transition::new(ANALYZE, "analyze", IMPROVE).effect(record_phase))
    .transition(Transition::new(IMPROVE, "improve", CONTROL).effect(record_phase))
    .transition(
        Transition::new(CONTROL, "control", CONTROL)
            .guard(validated)
            .effect(request_adoption),
    )
    .build()
}

fn has_project(span: &Span, _context: &Context) -> bool {
    span.attr_text("project_id").is_some()
}

fn define_project(input: &EffectInput<'_>) -> EffectResult {
    let span = input.span;
    Ok(Effects::none()
        .set_opt("project_id", span.attr_text("project_id"))
        .set_opt("problem_statement", span.attr_text("problem_statement"))
        .set_opt("sponsor", span.attr_text("sponsor"))
        .set_opt("defect_rate", span.attr_f64("defect_rate")))
}

/// Keep the latest phase's findings, keyed by phase.
fn record_phase(input: &EffectInput<'_>) -> EffectResult {
    let phase = input.span.trigger().to_string();
    Ok(Effects::none()
        .set("last_phase", phase.clone())
        .set_opt(format!("{phase}.summary"), input.span.attr_text("summary")))
}

fn validated(span: &Span, _context: &Context) -> bool {
    span.attr_bool("validated").unwrap_or(false)
}

fn request_adoption(input: &EffectInput<'_>) -> EffectResult {
    let project = input
        .span
        .attr_text("project_id")
        .or_else(|| ctx_str(input.context, "project_id").map(str::to_string))
        .ok_or_else(|| EffectError("control without a project_id".into()))?;

    Ok(Effects::none().set("validated", true).emit(
        Outbound::new("swarmsh.roberts.open", "open")
            .attr("motion_id", format!("adopt-{project}"))
            .attr("meeting_id", "board")
            .attr("project_id", project),
    ))
}
