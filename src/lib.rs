//! # swarmsh
//!
//! Broker-less coordination for finite-state-machine agents.
//!
//! Agents never call each other. Each one tails a shared, append-only JSONL
//! span log, matches spans against its transition table, and appends the
//! spans its effects produce, which in turn drive other agents.

pub mod agents;
pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod model;
pub mod orchestrator;
pub mod span_log;
pub mod telemetry;
pub mod watcher;
