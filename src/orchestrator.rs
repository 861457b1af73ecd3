//! Workflow orchestrator: seeds named scenarios onto the log.
//!
//! A driver on top of the runtime. It never talks to agents; it appends
//! seed spans under a fresh trace id and, where a scenario needs an
//! earlier cascade to land first, waits for it on the log.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::agents::{lean, roberts, scrum};
use crate::emitter::Emitter;
use crate::error::{Error, Result};
use crate::fsm::Outbound;
use crate::model::{Span, new_trace_id};
use crate::span_log::SpanLog;
use crate::watcher::{Shutdown, SpanWatcher, WatchConfig};

/// `swarm.agent` value on seed spans.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

/// Default wait for an awaited span.
const AWAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// One scenario step.
#[derive(Debug, Clone)]
pub enum Step {
    /// Append a span in the scenario's trace.
    Seed(Outbound),
    /// Wait until a span with this name appears in the trace.
    AwaitSpan { name: String, timeout: Duration },
}

/// A named, ordered list of steps plus the agent types it needs.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub required: Vec<&'static str>,
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Every built-in scenario.
    pub fn builtin() -> Vec<Scenario> {
        vec![
            Self::governance_delivery(),
            Self::quality_gate(),
            Self::full_loop(),
        ]
    }

    pub fn find(name: &str) -> Result<Scenario> {
        Self::builtin()
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::UnknownScenario(name.to_string()))
    }

    /// A motion is opened, voted on and carried; governance hands the
    /// sprint to delivery.
    pub fn governance_delivery() -> Scenario {
        Scenario {
            name: "governance-delivery",
            description: "motion passes, sprint planning starts",
            required: vec![roberts::AGENT_TYPE, scrum::AGENT_TYPE],
            steps: motion_steps(),
        }
    }

    /// A sprint review breaches the defect threshold and starts a DMAIC
    /// project.
    pub fn quality_gate() -> Scenario {
        Scenario {
            name: "quality-gate",
            description: "sprint review breaches defect threshold, DMAIC project starts",
            required: vec![scrum::AGENT_TYPE, lean::AGENT_TYPE],
            steps: vec![
                Step::Seed(
                    Outbound::new("swarmsh.scrum.plan", "plan")
                        .attr("sprint_number", "42")
                        .attr("team_id", "alpha")
                        .attr("capacity", 40),
                ),
                review_step(),
            ],
        }
    }

    /// Governance, delivery and improvement chained in one trace.
    pub fn full_loop() -> Scenario {
        let mut steps = motion_steps();
        steps.push(Step::AwaitSpan {
            name: "swarmsh.scrum.plan".to_string(),
            timeout: AWAIT_TIMEOUT,
        });
        steps.push(review_step());
        Scenario {
            name: "full-loop",
            description: "motion passes, sprint review breaches threshold, DMAIC starts",
            required: vec![roberts::AGENT_TYPE, scrum::AGENT_TYPE, lean::AGENT_TYPE],
            steps,
        }
    }
}

fn motion_steps() -> Vec<Step> {
    vec![
        Step::Seed(
            Outbound::new("swarmsh.roberts.open", "open")
                .attr("motion_id", "sprint_approval")
                .attr("meeting_id", "board"),
        ),
        Step::Seed(
            Outbound::new("swarmsh.roberts.vote", "vote")
                .attr("motion_id", "sprint_approval")
                .attr("voting_method", "voice"),
        ),
        Step::Seed(
            Outbound::new("swarmsh.roberts.close", "close")
                .attr("motion_id", "sprint_approval")
                .attr("vote_result", "pass")
                .attr("sprint_number", "42")
                .attr("team_id", "alpha"),
        ),
    ]
}

fn review_step() -> Step {
    Step::Seed(
        Outbound::new("swarmsh.scrum.review", "review")
            .attr("sprint_number", "42")
            .attr("defect_rate", 5.2)
            .attr("velocity", 38),
    )
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Starts scenarios against one log.
pub struct Orchestrator {
    log: Arc<SpanLog>,
    emitter: Emitter,
    agent_types: Vec<String>,
    watch: WatchConfig,
}

impl Orchestrator {
    /// `agent_types` are the types known to be running; scenarios requiring
    /// others are refused.
    pub fn new<I, S>(log: Arc<SpanLog>, agent_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            emitter: Emitter::new(Arc::clone(&log)),
            log,
            agent_types: agent_types.into_iter().map(Into::into).collect(),
            watch: WatchConfig::default(),
        }
    }

    pub fn with_watch_config(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    /// Start a built-in scenario by name. Returns its trace id.
    pub async fn start(&self, name: &str) -> Result<String> {
        let scenario = Scenario::find(name)?;
        self.run(&scenario).await
    }

    /// Run the steps of `scenario` under a fresh trace id.
    pub async fn run(&self, scenario: &Scenario) -> Result<String> {
        let missing: Vec<String> = scenario
            .required
            .iter()
            .filter(|t| !self.agent_types.iter().any(|have| have.as_str() == **t))
            .map(|t| t.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingAgents {
                scenario: scenario.name.to_string(),
                missing,
            });
        }

        let trace_id = new_trace_id();
        let mut first_position = None;

        for step in &scenario.steps {
            match step {
                Step::Seed(outbound) => {
                    let (position, _) = self
                        .emitter
                        .emit_in_trace(&trace_id, ORCHESTRATOR_ID, outbound)
                        .await?;
                    first_position.get_or_insert(position);
                }
                Step::AwaitSpan { name, timeout } => {
                    self.wait_for_span_from(first_position.unwrap_or(0), &trace_id, name, *timeout)
                        .await?;
                }
            }
        }

        info!(scenario = scenario.name, %trace_id, "scenario started");
        Ok(trace_id)
    }

    /// Wait until a span named `name` appears in `trace_id`.
    pub async fn wait_for_span(
        &self,
        trace_id: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<Span> {
        self.wait_for_span_from(0, trace_id, name, timeout).await
    }

    async fn wait_for_span_from(
        &self,
        offset: u64,
        trace_id: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<Span> {
        let stop = Shutdown::new();
        let mut watcher =
            SpanWatcher::new(Arc::clone(&self.log), offset, self.watch.clone(), stop.clone());

        let search = async {
            while let Some(entry) = watcher.next().await {
                watcher.commit();
                if entry.span.trace_id == trace_id && entry.span.name == name {
                    return Some(entry.span);
                }
            }
            None
        };

        let found = tokio::time::timeout(timeout, search).await;
        stop.trigger();
        match found {
            Ok(Some(span)) => Ok(span),
            Ok(None) | Err(_) => Err(Error::Timeout(format!("{name} in trace {trace_id}"))),
        }
    }

    /// Every span of a trace, in log order.
    pub async fn trace(&self, trace_id: &str) -> Result<Vec<Span>> {
        self.log.trace(trace_id).await
    }
}
