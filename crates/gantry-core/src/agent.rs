//! Agent types.

use crate::ids::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The state an agent reports when polling for work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub hostname: String,
    /// Resource tags this agent offers.
    pub resources: Vec<String>,
    /// Environments this agent is a member of.
    pub environments: Vec<String>,
    pub liveness: AgentLiveness,
    pub origin: AgentOrigin,
    pub last_heard_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLiveness {
    Idle,
    Building,
    LostContact,
    Disabled,
}

impl AgentLiveness {
    pub fn is_available(&self) -> bool {
        matches!(self, AgentLiveness::Idle)
    }
}

/// Local agents run co-located with the server; remote (elastic) agents are
/// provisioned elsewhere and are subject to concurrency and licensing caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOrigin {
    Local,
    Remote,
}

impl AgentSnapshot {
    pub fn is_available(&self) -> bool {
        self.liveness.is_available()
    }

    pub fn is_remote(&self) -> bool {
        self.origin == AgentOrigin::Remote
    }

    /// All required resource tags must be offered by this agent.
    pub fn has_resources(&self, required: &[String]) -> bool {
        required.iter().all(|r| self.resources.contains(r))
    }

    /// Environment matching: a job in an environment only runs on agents in
    /// that environment; a job without one only runs on unscoped agents.
    pub fn serves_environment(&self, environment: Option<&str>) -> bool {
        match environment {
            Some(env) => self.environments.iter().any(|e| e == env),
            None => self.environments.is_empty(),
        }
    }
}
