//! Pipeline instances, stages, and jobs.

use crate::build_cause::BuildCause;
use crate::error::{Error, Result};
use crate::ids::{AgentId, InstanceId, JobId};
use crate::pipeline::{JobConfig, PipelineConfig, StageConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageResult {
    Passed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Scheduled,
    Building,
    Completed(StageResult),
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Completed(_))
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Assigned,
    Building,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub agent: Option<AgentId>,
    pub resources: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
}

impl Job {
    pub fn from_config(config: &JobConfig) -> Self {
        Self {
            id: JobId::new(),
            name: config.name.clone(),
            state: JobState::Scheduled,
            agent: None,
            resources: config.resources.clone(),
            scheduled_at: Utc::now(),
        }
    }

    /// Single atomic transition from `Scheduled` to `Assigned`. A job is
    /// bound to at most one agent at any time.
    pub fn assign(&mut self, agent: AgentId) -> Result<()> {
        if self.state != JobState::Scheduled {
            return Err(Error::JobAlreadyAssigned(self.id.to_string()));
        }
        self.state = JobState::Assigned;
        self.agent = Some(agent);
        Ok(())
    }

    pub fn unassign(&mut self) {
        self.state = JobState::Scheduled;
        self.agent = None;
    }

    pub fn complete(&mut self) {
        self.state = JobState::Completed;
    }
}

/// A scheduled stage. `order_id` is monotonic within the pipeline's stage
/// sequence and preserved across reruns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub order_id: u64,
    pub state: StageState,
    pub jobs: Vec<Job>,
    pub approved_by: Option<String>,
    pub rerun: bool,
    pub created_at: DateTime<Utc>,
}

impl Stage {
    pub fn from_config(config: &StageConfig, order_id: u64) -> Self {
        Self {
            name: config.name.clone(),
            order_id,
            state: StageState::Scheduled,
            jobs: config.jobs.iter().map(Job::from_config).collect(),
            approved_by: None,
            rerun: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn complete(&mut self, result: StageResult) {
        self.state = StageState::Completed(result);
        if result == StageResult::Cancelled {
            for job in &mut self.jobs {
                job.complete();
            }
        }
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInstance {
    pub id: InstanceId,
    pub name: String,
    pub counter: u64,
    pub group: String,
    pub environment: Option<String>,
    pub build_cause: BuildCause,
    pub stages: Vec<Stage>,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
}

impl PipelineInstance {
    pub fn new(
        config: &PipelineConfig,
        counter: u64,
        build_cause: BuildCause,
        first_stage: Stage,
    ) -> Self {
        Self {
            id: InstanceId::new(),
            name: config.name.clone(),
            counter,
            group: config.group.clone(),
            environment: config.environment.clone(),
            build_cause,
            stages: vec![first_stage],
            state: InstanceState::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == InstanceState::Cancelled
    }

    pub fn cancel(&mut self) {
        self.state = InstanceState::Cancelled;
        for stage in &mut self.stages {
            if stage.is_active() {
                stage.complete(StageResult::Cancelled);
            }
        }
    }

    /// Highest order id ever used in this instance, reruns included.
    pub fn max_order(&self) -> u64 {
        self.stages.iter().map(|s| s.order_id).max().unwrap_or(0)
    }

    /// The most recent attempt of a stage, by name.
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().rev().find(|s| s.name == name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut Stage> {
        self.stages.iter_mut().rev().find(|s| s.name == name)
    }

    pub fn find_job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.stages.iter_mut().find_map(|s| s.job_mut(id))
    }
}
