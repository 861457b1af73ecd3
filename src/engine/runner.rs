//! Agent runner: one watcher feeding one agent, strictly in log order.
//!
//! For each delivered span the runner decides, publishes whatever the
//! decision emits, and only then commits the state change and advances the
//! cursor. A crash anywhere in between replays the span; cascade ids are
//! deterministic so the replay cannot duplicate them on the log.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, warn};

use crate::emitter::Emitter;
use crate::error::{Error, Result};
use crate::fsm::{Agent, AgentSnapshot, Decision, TransitionResult};
pub use crate::model::TRANSITION_SPAN;
use crate::model::{Span, derived_span_id};
use crate::span_log::{LogEntry, SpanLog};
use crate::telemetry::agent::{record_transition, start_processing_span};
use crate::telemetry::metrics;
use crate::watcher::{Shutdown, SpanWatcher, WatchConfig};

/// Configuration for agent runners.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Consecutive failures on one span before it is skipped.
    pub max_effect_attempts: u32,
    /// Append a [`TRANSITION_SPAN`] record for every applied transition.
    pub emit_transition_spans: bool,
    /// Write a snapshot per agent here after every committed span.
    pub checkpoint_dir: Option<PathBuf>,
    /// Pause before retrying a failed span.
    pub retry_backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_effect_attempts: 5,
            emit_transition_spans: true,
            checkpoint_dir: None,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Live view of one runner, published on a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStatus {
    pub id: String,
    pub agent_type: String,
    pub state: String,
    /// Committed log offset.
    pub position: u64,
    /// Spans matched so far.
    pub processed: usize,
    /// Failures on the span currently being retried.
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

impl AgentStatus {
    fn of(agent: &Agent, position: u64) -> Self {
        Self {
            id: agent.id().to_string(),
            agent_type: agent.agent_type().to_string(),
            state: agent.state().to_string(),
            position,
            processed: agent.processed_count(),
            consecutive_failures: 0,
            total_failures: 0,
            last_error: None,
        }
    }
}

/// Outcome of one processing attempt.
enum Step {
    Done(TransitionResult),
    Failed(String),
}

/// Drives one agent from its own watcher until shutdown.
pub struct AgentRunner {
    agent: Agent,
    watcher: SpanWatcher,
    emitter: Emitter,
    config: RunnerConfig,
    shutdown: Shutdown,
    status: watch::Sender<AgentStatus>,
}

impl AgentRunner {
    /// Set up a runner. With a checkpoint directory and an existing
    /// snapshot for this agent, resumes from the snapshot instead of
    /// replaying from offset 0.
    pub async fn new(
        agent: Agent,
        log: Arc<SpanLog>,
        watch_config: WatchConfig,
        config: RunnerConfig,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let (agent, offset) = match &config.checkpoint_dir {
            Some(dir) => match load_checkpoint(dir, agent.id()).await? {
                Some(snapshot) => {
                    let offset = snapshot.offset;
                    let restored = Agent::restore(Arc::clone(agent.table()), snapshot)?;
                    info!(
                        agent = restored.id(),
                        state = restored.state(),
                        position = offset,
                        "resuming from checkpoint"
                    );
                    (restored, offset)
                }
                None => (agent, 0),
            },
            None => (agent, 0),
        };

        let (status, _) = watch::channel(AgentStatus::of(&agent, offset));
        Ok(Self {
            watcher: SpanWatcher::new(Arc::clone(&log), offset, watch_config, shutdown.clone()),
            emitter: Emitter::new(log),
            agent,
            config,
            shutdown,
            status,
        })
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Subscribe to status updates.
    pub fn status(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    /// Process spans until shutdown, then hand back the agent.
    pub async fn run(mut self) -> Result<Agent> {
        info!(
            agent = self.agent.id(),
            agent_type = self.agent.agent_type(),
            state = self.agent.state(),
            position = self.watcher.cursor(),
            "agent runner started"
        );

        while let Some(entry) = self.watcher.next().await {
            let step = match self.process(&entry).await {
                Ok(step) => step,
                // Storage errors never skip a span: its cascades would be lost.
                Err(e) => {
                    warn!(agent = self.agent.id(), position = entry.position, "span log unavailable: {e}");
                    self.record_failure(e.to_string());
                    self.pause().await;
                    continue;
                }
            };

            match step {
                Step::Done(_) => {
                    self.watcher.commit();
                    self.publish_status(|status| {
                        status.consecutive_failures = 0;
                    });
                    self.checkpoint().await;
                }
                Step::Failed(reason) => {
                    let failures = self.record_failure(reason.clone());
                    if failures >= self.config.max_effect_attempts {
                        error!(
                            agent = self.agent.id(),
                            state = self.agent.state(),
                            span = %entry.span.name,
                            position = entry.position,
                            failures,
                            "agent stuck in state {}, error surfaced {failures} times, skipping span: {reason}",
                            self.agent.state()
                        );
                        self.watcher.commit();
                        self.publish_status(|status| status.consecutive_failures = 0);
                        self.checkpoint().await;
                    } else {
                        self.pause().await;
                    }
                }
            }
        }

        info!(
            agent = self.agent.id(),
            state = self.agent.state(),
            "agent runner stopped"
        );
        Ok(self.agent)
    }

    /// Offer one span to the agent and publish what it produces.
    async fn process(&mut self, entry: &LogEntry) -> Result<Step> {
        let span = &entry.span;
        let agent_type = self.agent.agent_type().to_string();
        let work_span = start_processing_span(self.agent.id(), &agent_type, &span.name);
        let started = Instant::now();

        let step = async {
            let decision = self.agent.decide_at(span, entry.position);
            let outbound = decision.outbound().to_vec();

            if let Decision::Fail {
                state,
                trigger,
                error,
            } = &decision
            {
                metrics::effect_failures().add(
                    1,
                    &[
                        KeyValue::new("agent_type", agent_type.clone()),
                        KeyValue::new("state", *state),
                        KeyValue::new("trigger", trigger.clone()),
                    ],
                );
                warn!(
                    agent = self.agent.id(),
                    state,
                    %trigger,
                    position = entry.position,
                    "effect failed: {error}"
                );
                return Ok(Step::Failed(error.to_string()));
            }

            // Cascades go on the log before the state moves.
            self.emitter.publish_all(&outbound).await?;

            if self.config.emit_transition_spans {
                if let Decision::Fire {
                    fingerprint,
                    from,
                    to,
                    trigger,
                    ..
                } = &decision
                {
                    let record = transition_record(
                        self.agent.id(),
                        &agent_type,
                        span,
                        fingerprint,
                        from,
                        to,
                        trigger,
                    );
                    self.emitter.publish(&record).await?;
                }
            }

            let result = self.agent.commit(decision);
            match &result {
                TransitionResult::Applied { from, to, trigger, emitted } => {
                    record_transition(&work_span, from, to, trigger);
                    metrics::transitions().add(
                        1,
                        &[
                            KeyValue::new("agent_type", agent_type.clone()),
                            KeyValue::new("from", *from),
                            KeyValue::new("to", *to),
                        ],
                    );
                    info!(
                        agent = self.agent.id(),
                        from,
                        to,
                        %trigger,
                        trace_id = %span.trace_id,
                        emitted = emitted.len(),
                        "transition applied"
                    );
                }
                TransitionResult::GuardRejected { state, trigger, emitted } => {
                    metrics::guard_rejections().add(
                        1,
                        &[
                            KeyValue::new("agent_type", agent_type.clone()),
                            KeyValue::new("state", *state),
                            KeyValue::new("trigger", trigger.clone()),
                        ],
                    );
                    info!(
                        agent = self.agent.id(),
                        state,
                        %trigger,
                        trace_id = %span.trace_id,
                        emitted = emitted.len(),
                        "guard rejected"
                    );
                }
                TransitionResult::Duplicate => {
                    debug!(agent = self.agent.id(), position = entry.position, "span already applied");
                }
                TransitionResult::NoMatch | TransitionResult::EffectFailed { .. } => {}
            }
            Ok::<Step, Error>(Step::Done(result))
        }
        .instrument(work_span.clone())
        .await;

        let outcome = match &step {
            Ok(Step::Done(TransitionResult::Applied { .. })) => "applied",
            Ok(Step::Done(TransitionResult::GuardRejected { .. })) => "rejected",
            Ok(Step::Done(_)) => "ignored",
            Ok(Step::Failed(_)) => "effect_failed",
            Err(_) => "error",
        };
        metrics::processing_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("agent_type", agent_type),
                KeyValue::new("outcome", outcome),
            ],
        );

        step
    }

    /// Count a failure against the current span; returns the consecutive count.
    fn record_failure(&self, reason: String) -> u32 {
        let mut failures = 0;
        self.status.send_modify(|status| {
            status.consecutive_failures += 1;
            status.total_failures += 1;
            status.last_error = Some(reason);
            failures = status.consecutive_failures;
        });
        failures
    }

    fn publish_status(&self, update: impl FnOnce(&mut AgentStatus)) {
        let position = self.watcher.cursor();
        let (state, processed) = (self.agent.state(), self.agent.processed_count());
        self.status.send_modify(|status| {
            status.state = state.to_string();
            status.position = position;
            status.processed = processed;
            update(status);
        });
    }

    async fn pause(&self) {
        tokio::select! {
            _ = self.shutdown.wait() => {}
            _ = tokio::time::sleep(self.config.retry_backoff) => {}
        }
    }

    /// Persist the committed position. A failed write is surfaced and
    /// retried; it never stops the runner. On shutdown the last attempt is
    /// abandoned and the agent resumes from its previous checkpoint.
    async fn checkpoint(&self) {
        let mut failed = false;
        while let Err(e) = self.save_checkpoint().await {
            warn!(
                agent = self.agent.id(),
                position = self.watcher.cursor(),
                "checkpoint write failed: {e}"
            );
            self.record_failure(format!("checkpoint write failed: {e}"));
            failed = true;
            if self.shutdown.is_triggered() {
                return;
            }
            self.pause().await;
        }
        if failed {
            self.publish_status(|status| status.consecutive_failures = 0);
        }
    }

    async fn save_checkpoint(&self) -> Result<()> {
        let Some(dir) = &self.config.checkpoint_dir else {
            return Ok(());
        };
        let snapshot = self.agent.snapshot(self.watcher.cursor());
        write_checkpoint(dir, &snapshot).await
    }
}

/// The record of an applied transition. Its id is derived from the agent
/// and the triggering span so a replay does not log it twice.
fn transition_record(
    agent_id: &str,
    agent_type: &str,
    source: &Span,
    fingerprint: &str,
    from: &str,
    to: &str,
    trigger: &str,
) -> Span {
    Span::builder(TRANSITION_SPAN, &source.trace_id)
        .span_id(derived_span_id(&[agent_id, fingerprint, TRANSITION_SPAN]))
        .parent(source.span_id.clone())
        .agent(agent_id)
        .attr("swarm.agent.type", agent_type)
        .attr("swarm.agent.transition.from", from)
        .attr("swarm.agent.transition.to", to)
        .attr("swarm.agent.transition.trigger", trigger)
        .build()
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

fn checkpoint_path(dir: &Path, agent_id: &str) -> PathBuf {
    dir.join(format!("{agent_id}.json"))
}

/// Read an agent's snapshot, if one was written.
pub async fn load_checkpoint(dir: &Path, agent_id: &str) -> Result<Option<AgentSnapshot>> {
    let path = checkpoint_path(dir, agent_id);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
        Error::Other(format!("corrupt checkpoint {}: {e}", path.display()))
    })?;
    Ok(Some(snapshot))
}

/// Replace an agent's snapshot atomically (write temp file, then rename).
pub async fn write_checkpoint(dir: &Path, snapshot: &AgentSnapshot) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = checkpoint_path(dir, &snapshot.id);
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

/// Rebuild agents by applying every span on the log, without emitting.
/// Returns how many spans were read.
pub async fn replay(log: &SpanLog, agents: &mut [Agent]) -> Result<usize> {
    let entries = log.read_all().await?;
    for entry in &entries {
        for agent in agents.iter_mut() {
            agent.apply_at(&entry.span, entry.position);
        }
    }
    Ok(entries.len())
}
