//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and its
//! external collaborators: the change sources, the configuration document,
//! persistence, permission evaluation, storage health, and licensing.

use crate::events::Event;
use crate::ids::{AgentId, JobId};
use crate::instance::{PipelineInstance, Stage};
use crate::material::{Material, Modification, Revision};
use crate::pipeline::PipelineConfig;
use crate::timeline::TimelineEntry;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
///
/// Pattern supports wildcards: `stage.*.deploy`, `agent.>`
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;

    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// External material change source.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Poll for modifications on `material` newer than `since`.
    /// `since = None` asks for the full known history, oldest first.
    async fn poll_changes(
        &self,
        material: &Material,
        since: Option<&Revision>,
    ) -> Result<Vec<Modification>>;
}

/// Read-only view of the configuration document.
#[async_trait]
pub trait PipelineConfigSource: Send + Sync {
    /// All pipelines in configuration order; group order follows from it.
    async fn pipelines(&self) -> Result<Vec<PipelineConfig>>;

    async fn pipeline(&self, name: &str) -> Result<Option<PipelineConfig>>;
}

/// A job eligible for dispatch, as seen by the work assignment path.
#[derive(Debug, Clone)]
pub struct RunnableJob {
    pub job_id: JobId,
    pub pipeline: String,
    pub counter: u64,
    pub group: String,
    pub stage: String,
    pub stage_order: u64,
    pub job_name: String,
    pub resources: Vec<String>,
    pub environment: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

/// Outcome of an atomic job assignment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    Assigned,
    /// Another agent won the compare-and-set.
    AlreadyTaken,
    /// The owning instance was cancelled between selection and bind.
    InstanceCancelled,
}

/// Persistence for instances, stages, jobs, and the timeline.
///
/// `create_instance` is transactional: the instance with its stages and jobs
/// and the timeline entry commit atomically or not at all.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn next_counter(&self, pipeline: &str) -> Result<u64>;

    async fn create_instance(
        &self,
        instance: &PipelineInstance,
        timeline_entry: &TimelineEntry,
    ) -> Result<()>;

    async fn instance(&self, pipeline: &str, counter: u64) -> Result<Option<PipelineInstance>>;

    async fn latest_instance(&self, pipeline: &str) -> Result<Option<PipelineInstance>>;

    /// Persist the current state of an instance (stages and jobs included).
    async fn update_instance(&self, instance: &PipelineInstance) -> Result<()>;

    /// All timeline entries in natural order, for boot-time replay.
    async fn timeline_entries(&self) -> Result<Vec<TimelineEntry>>;

    /// Jobs in `Scheduled` state across all active instances.
    async fn runnable_jobs(&self) -> Result<Vec<RunnableJob>>;

    /// Atomic compare-and-set of a job from `Scheduled` to `Assigned`,
    /// observing cancellation of the owning instance.
    async fn try_assign_job(&self, job_id: JobId, agent_id: AgentId) -> Result<AssignOutcome>;

    async fn complete_job(&self, job_id: JobId) -> Result<()>;
}

/// Permission evaluation; the core only consumes the decision.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn can_operate(&self, user: &str, group: &str) -> Result<bool>;
}

/// Free-space probes for the artifact store and the database volume.
#[async_trait]
pub trait StorageMonitor: Send + Sync {
    async fn artifact_free_bytes(&self) -> Result<u64>;

    async fn database_free_bytes(&self) -> Result<u64>;
}

/// Edition tier consumed from license metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditionTier {
    Unrestricted,
    Restricted,
}

pub trait EditionProvider: Send + Sync {
    fn edition(&self) -> EditionTier;
}

impl RunnableJob {
    pub fn from_stage(instance: &PipelineInstance, stage: &Stage) -> Vec<RunnableJob> {
        stage
            .jobs
            .iter()
            .filter(|j| j.state == crate::instance::JobState::Scheduled)
            .map(|j| RunnableJob {
                job_id: j.id,
                pipeline: instance.name.clone(),
                counter: instance.counter,
                group: instance.group.clone(),
                stage: stage.name.clone(),
                stage_order: stage.order_id,
                job_name: j.name.clone(),
                resources: j.resources.clone(),
                environment: instance.environment.clone(),
                scheduled_at: j.scheduled_at,
            })
            .collect()
    }
}
