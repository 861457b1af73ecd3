//! Swarm supervisor: one task per agent, one shared log, one shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::runner::{AgentRunner, AgentStatus, RunnerConfig};
use crate::error::{Error, Result};
use crate::fsm::Agent;
use crate::span_log::SpanLog;
use crate::watcher::{Shutdown, WatchConfig};

struct Member {
    id: String,
    agent_type: String,
    status: watch::Receiver<AgentStatus>,
    task: JoinHandle<Result<Agent>>,
}

/// A set of running agents sharing one span log.
pub struct Swarm {
    log: Arc<SpanLog>,
    shutdown: Shutdown,
    members: Vec<Member>,
}

impl Swarm {
    pub fn new(log: Arc<SpanLog>, shutdown: Shutdown) -> Self {
        Self {
            log,
            shutdown,
            members: Vec::new(),
        }
    }

    pub fn log(&self) -> &Arc<SpanLog> {
        &self.log
    }

    /// Start a runner task for `agent`.
    pub async fn spawn(
        &mut self,
        agent: Agent,
        watch: WatchConfig,
        config: RunnerConfig,
    ) -> Result<()> {
        if self.members.iter().any(|m| m.id == agent.id()) {
            return Err(Error::Config(format!("agent {} is already running", agent.id())));
        }

        let runner = AgentRunner::new(
            agent,
            Arc::clone(&self.log),
            watch,
            config,
            self.shutdown.clone(),
        )
        .await?;
        let id = runner.agent().id().to_string();
        let agent_type = runner.agent().agent_type().to_string();
        let status = runner.status();

        info!(agent = %id, agent_type = %agent_type, "spawning agent");
        let task = tokio::spawn(runner.run());

        self.members.push(Member {
            id,
            agent_type,
            status,
            task,
        });
        Ok(())
    }

    pub fn agent_ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.id.as_str()).collect()
    }

    /// Types of the running agents, sorted and deduplicated.
    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.members.iter().map(|m| m.agent_type.clone()).collect();
        types.sort();
        types.dedup();
        types
    }

    /// Latest status of one agent.
    pub fn status(&self, id: &str) -> Option<AgentStatus> {
        self.member(id).map(|m| m.status.borrow().clone())
    }

    /// Status updates of one agent. The channel closes when its runner ends.
    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<AgentStatus>> {
        self.member(id).map(|m| m.status.clone())
    }

    /// Latest status of every agent, in spawn order.
    pub fn statuses(&self) -> Vec<AgentStatus> {
        self.members
            .iter()
            .map(|m| m.status.borrow().clone())
            .collect()
    }

    /// Wait until agent `id` reports `state`.
    pub async fn wait_for_state(
        &self,
        id: &str,
        state: &str,
        timeout: Duration,
    ) -> Result<AgentStatus> {
        let mut rx = self
            .member(id)
            .ok_or_else(|| Error::Other(format!("no agent {id} in swarm")))?
            .status
            .clone();

        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| s.state == state)).await;
        match waited {
            Ok(Ok(status)) => Ok(status.clone()),
            Ok(Err(_)) => Err(Error::Other(format!("agent {id} stopped before reaching {state}"))),
            Err(_) => Err(Error::Timeout(format!("agent {id} to reach {state}"))),
        }
    }

    /// Signal every runner to stop and collect the final agents. Every task
    /// is joined before the first failure, if any, is returned.
    pub async fn shutdown(self) -> Result<Vec<Agent>> {
        self.shutdown.trigger();

        let mut agents = Vec::with_capacity(self.members.len());
        let mut first_error = None;
        for member in self.members {
            let failure = match member.task.await {
                Ok(Ok(agent)) => {
                    agents.push(agent);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) => Error::Other(format!("agent {} task panicked: {e}", member.id)),
            };
            error!(agent = %member.id, "agent runner failed: {failure}");
            first_error.get_or_insert(failure);
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        info!(agents = agents.len(), "swarm stopped");
        Ok(agents)
    }

    fn member(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }
}
