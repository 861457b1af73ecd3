//! Agent type registry and roster.
//!
//! An agent type is nothing more than a named [`TransitionTable`]. The
//! registry holds one shared table per type; a roster says which agents to
//! run and with what parameters.

pub mod lean;
pub mod ping;
pub mod roberts;
pub mod scrum;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::fsm::{Agent, Context, TransitionTable};

/// Registry of agent types, indexed by type name.
pub struct AgentTypes {
    tables: HashMap<String, Arc<TransitionTable>>,
}

impl AgentTypes {
    /// Create an empty registry with no agent types.
    pub fn empty() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }

    /// Registry with the built-in governance, delivery, improvement and
    /// ping types.
    pub fn builtin() -> Result<Self> {
        let mut types = Self::empty();
        types.register(roberts::table()?);
        types.register(scrum::table()?);
        types.register(lean::table()?);
        types.register(ping::table()?);
        Ok(types)
    }

    /// Add or replace a type.
    pub fn register(&mut self, table: TransitionTable) {
        self.tables
            .insert(table.agent_type().to_string(), Arc::new(table));
    }

    /// Look up a type's table by name.
    pub fn get(&self, agent_type: &str) -> Option<&Arc<TransitionTable>> {
        self.tables.get(agent_type)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct a fresh agent for a roster entry.
    pub fn create(&self, spec: &AgentSpec) -> Result<Agent> {
        let table = self
            .get(&spec.agent_type)
            .ok_or_else(|| Error::UnknownAgentType(spec.agent_type.clone()))?;
        Ok(Agent::new(&spec.id, Arc::clone(table)).with_context(spec.params.clone()))
    }
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// One agent to run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Seeds the agent's context, e.g. `defect_threshold`.
    #[serde(default)]
    pub params: Context,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            params: Context::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// The set of agents a process runs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Roster {
    #[serde(rename = "agent", default)]
    pub agents: Vec<AgentSpec>,
}

impl Roster {
    /// One agent per built-in type, each named after its type.
    pub fn builtin() -> Self {
        let agents = [
            roberts::AGENT_TYPE,
            scrum::AGENT_TYPE,
            lean::AGENT_TYPE,
            ping::AGENT_TYPE,
        ]
        .into_iter()
        .map(|t| AgentSpec::new(t, t))
        .collect();
        Self { agents }
    }

    /// Parse a roster from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let roster: Roster =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad roster: {e}")))?;
        roster.validate()?;
        Ok(roster)
    }

    /// Load a roster file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read roster {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Roster file if given, otherwise the built-in roster.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::builtin()),
        }
    }

    /// Instantiate every agent against `types`.
    pub fn instantiate(&self, types: &AgentTypes) -> Result<Vec<Agent>> {
        self.agents.iter().map(|spec| types.create(spec)).collect()
    }

    fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(Error::Config("roster defines no agents".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for spec in &self.agents {
            if !seen.insert(spec.id.as_str()) {
                return Err(Error::Config(format!("duplicate agent id {}", spec.id)));
            }
        }
        Ok(())
    }
}
