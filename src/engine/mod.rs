//! Run loop: per-agent runners and the swarm that supervises them.

pub mod runner;
pub mod swarm;

pub use runner::{AgentRunner, AgentStatus, RunnerConfig, TRANSITION_SPAN, replay};
pub use swarm::Swarm;
