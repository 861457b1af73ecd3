//! Minimal liveness agent: answers a ping with a pong, once.

use crate::error::Result;
use crate::fsm::{EffectInput, EffectResult, Effects, Outbound, Transition, TransitionTable};

pub const AGENT_TYPE: &str = "ping";

pub const IDLE: &str = "IDLE";
pub const PINGED: &str = "PINGED";

pub fn table() -> Result<TransitionTable> {
    TransitionTable::builder(AGENT_TYPE, &[IDLE, PINGED], IDLE)
        .listen("swarmsh.ping.")
        .terminal(&[PINGED])
        .transition(Transition::new(IDLE, "ping", PINGED).effect(pong))
        .build()
}

fn pong(input: &EffectInput<'_>) -> EffectResult {
    Ok(Effects::none().emit(
        Outbound::new("swarmsh.ping.pong", "pong").attr("ping_id", input.fingerprint),
    ))
}
