//! Scheduling event types.
//!
//! Dispatch and health-reporting consumers are decoupled from the resolver
//! through the event bus; consumers observe events in the order they were
//! published per subject.

use crate::agent::AgentLiveness;
use crate::build_cause::TriggerKind;
use crate::health::HealthSeverity;
use crate::ids::{AgentId, InstanceId, JobId};
use crate::instance::StageResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events published by the scheduling core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Instance lifecycle
    InstanceCreated(InstanceCreatedPayload),
    InstanceCompleted(InstanceCompletedPayload),

    // Stage lifecycle
    StageScheduled(StageScheduledPayload),
    StageCompleted(StageCompletedPayload),

    // Job / dispatch
    JobAssigned(JobAssignedPayload),
    JobCompleted(JobCompletedPayload),

    // Agent
    AgentStatusChanged(AgentStatusChangedPayload),

    // Health
    HealthChanged(HealthChangedPayload),
}

impl Event {
    /// Routing subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::InstanceCreated(p) => format!("instance.created.{}", p.pipeline),
            Event::InstanceCompleted(p) => {
                format!("instance.completed.{}.{}", p.pipeline, p.counter)
            }
            Event::StageScheduled(p) => {
                format!("stage.scheduled.{}.{}.{}", p.pipeline, p.counter, p.stage)
            }
            Event::StageCompleted(p) => {
                format!("stage.completed.{}.{}.{}", p.pipeline, p.counter, p.stage)
            }
            Event::JobAssigned(p) => format!("job.assigned.{}", p.job_id),
            Event::JobCompleted(p) => format!("job.completed.{}", p.job_id),
            Event::AgentStatusChanged(p) => format!("agent.{}.status", p.agent_id),
            Event::HealthChanged(p) => format!("health.{}", p.name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceCreatedPayload {
    pub instance_id: InstanceId,
    pub pipeline: String,
    pub counter: u64,
    pub trigger: TriggerKind,
    pub approver: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceCompletedPayload {
    pub instance_id: InstanceId,
    pub pipeline: String,
    pub counter: u64,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageScheduledPayload {
    pub pipeline: String,
    pub counter: u64,
    pub stage: String,
    pub order_id: u64,
    pub rerun: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCompletedPayload {
    pub pipeline: String,
    pub counter: u64,
    pub stage: String,
    pub result: StageResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAssignedPayload {
    pub job_id: JobId,
    pub agent_id: AgentId,
    pub pipeline: String,
    pub counter: u64,
    pub stage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletedPayload {
    pub job_id: JobId,
    pub pipeline: String,
    pub counter: u64,
    pub stage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusChangedPayload {
    pub agent_id: AgentId,
    pub from: AgentLiveness,
    pub to: AgentLiveness,
}

/// `severity = None` means the named entry cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthChangedPayload {
    pub name: String,
    pub severity: Option<HealthSeverity>,
    pub message: Option<String>,
}
