//! Governance agent following Robert's Rules of Order.
//!
//! `IDLE --open--> MOTION_OPEN --vote--> VOTING --close--> CLOSED`
//!
//! Closing is guarded by the motion having passed. A passed motion cascades
//! into sprint planning (`swarmsh.scrum.plan`); a failed one records
//! `swarmsh.roberts.rejected` and the motion stays in `VOTING`.

use crate::error::Result;
use crate::fsm::{
    Context, EffectInput, EffectResult, Effects, Outbound, Transition, TransitionTable, ctx_f64,
    ctx_str,
};
use crate::model::Span;

pub const AGENT_TYPE: &str = "roberts";

pub const IDLE: &str = "IDLE";
pub const MOTION_OPEN: &str = "MOTION_OPEN";
pub const VOTING: &str = "VOTING";
pub const CLOSED: &str = "CLOSED";

pub fn table() -> Result<TransitionTable> {
    TransitionTable::builder(AGENT_TYPE, &[IDLE, MOTION_OPEN, VOTING, CLOSED], IDLE)
        .listen("swarmsh.roberts.")
        .terminal(&[CLOSED])
        .transition(Transition::new(IDLE, "open", MOTION_OPEN).effect(open_motion))
        .transition(Transition::new(MOTION_OPEN, "vote", VOTING).effect(call_vote))
        .transition(
            Transition::new(VOTING, "close", CLOSED)
                .guard(motion_passed)
                .effect(adjourn)
                .on_reject(record_failure),
        )
        .build()
}

fn open_motion(input: &EffectInput<'_>) -> EffectResult {
    let span = input.span;
    Ok(Effects::none()
        .set(
            "motion_id",
            span.attr_text("motion_id").unwrap_or_else(|| "unknown".into()),
        )
        .set(
            "meeting_id",
            span.attr_text("meeting_id").unwrap_or_else(|| "board".into()),
        ))
}

fn call_vote(input: &EffectInput<'_>) -> EffectResult {
    let span = input.span;
    Ok(Effects::none()
        .set_opt("voting_method", span.attr_text("voting_method"))
        .set_opt("votes_yes", span.attr_f64("votes_yes"))
        .set_opt("votes_no", span.attr_f64("votes_no")))
}

/// An explicit result wins; otherwise compare the tally, preferring counts
/// on the closing span over those recorded when the vote was called.
fn motion_passed(span: &Span, context: &Context) -> bool {
    if let Some(result) = span
        .attr_str("vote_result")
        .or_else(|| span.attr_str("result"))
    {
        return matches!(
            result.to_ascii_lowercase().as_str(),
            "pass" | "passed" | "approved" | "carried"
        );
    }

    let yes = span
        .attr_f64("votes_yes")
        .or_else(|| ctx_f64(context, "votes_yes"));
    let no = span
        .attr_f64("votes_no")
        .or_else(|| ctx_f64(context, "votes_no"));
    matches!((yes, no), (Some(yes), Some(no)) if yes > no)
}

fn motion_id(input: &EffectInput<'_>) -> String {
    input
        .span
        .attr_text("motion_id")
        .or_else(|| ctx_str(input.context, "motion_id").map(str::to_string))
        .unwrap_or_else(|| "unknown".into())
}

fn adjourn(input: &EffectInput<'_>) -> EffectResult {
    let span = input.span;
    let motion_id = motion_id(input);

    let mut plan = Outbound::new("swarmsh.scrum.plan", "plan").attr("motion_id", motion_id.clone());
    for key in ["sprint_number", "team_id", "capacity"] {
        if let Some(value) = span.attr(key) {
            plan = plan.attr(key, value.clone());
        }
    }

    Ok(Effects::none()
        .set("motion_id", motion_id)
        .set("outcome", "passed")
        .emit(plan))
}

fn record_failure(input: &EffectInput<'_>) -> EffectResult {
    let span = input.span;
    let mut rejected = Outbound::new("swarmsh.roberts.rejected", "rejected")
        .attr("motion_id", motion_id(input));
    if let Some(result) = span.attr_text("vote_result").or_else(|| span.attr_text("result")) {
        rejected = rejected.attr("vote_result", result);
    }
    Ok(Effects::none().emit(rejected))
}
