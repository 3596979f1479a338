//! The scheduling loop and manual operations.
//!
//! One `PipelineScheduler` owns the whole trigger path: material resolution,
//! fan-in, the schedule queue, instance creation, and stage progression.
//! Concurrent triggers for the same pipeline serialize on a per-pipeline
//! lock; triggers for different pipelines proceed independently. Instance
//! creation persists transactionally before the timeline entry becomes
//! visible to fan-in resolution.

use crate::fanin::BuildCauseResolver;
use crate::guard::SchedulingGuard;
use crate::queue::PipelineScheduleQueue;
use crate::stages::StageOrderingEngine;
use chrono::Utc;
use gantry_core::build_cause::{BuildCause, TriggerKind};
use gantry_core::events::{
    Event, InstanceCompletedPayload, InstanceCreatedPayload, JobCompletedPayload,
    StageCompletedPayload, StageScheduledPayload,
};
use gantry_core::ids::JobId;
use gantry_core::instance::{InstanceState, PipelineInstance, StageResult};
use gantry_core::material::Revision;
use gantry_core::operation::{OperationResult, OperationStatus};
use gantry_core::pipeline::PipelineConfig;
use gantry_core::ports::{EventBus, InstanceRepository, PipelineConfigSource};
use gantry_core::timeline::{PipelineTimeline, ResolvedRevision, TimelineEntry};
use gantry_core::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct PipelineScheduler {
    configs: Arc<dyn PipelineConfigSource>,
    repository: Arc<dyn InstanceRepository>,
    resolver: BuildCauseResolver,
    guard: SchedulingGuard,
    bus: Arc<dyn EventBus>,
    timeline: Arc<RwLock<PipelineTimeline>>,
    queue: PipelineScheduleQueue,
    ordering: StageOrderingEngine,
    /// Per-pipeline mutual exclusion for trigger and progression paths.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Build cause of the most recent instance per pipeline, for change
    /// detection and trigger deduplication.
    last_causes: RwLock<HashMap<String, BuildCause>>,
    tick_interval: Duration,
}

impl PipelineScheduler {
    pub fn new(
        configs: Arc<dyn PipelineConfigSource>,
        repository: Arc<dyn InstanceRepository>,
        resolver: BuildCauseResolver,
        guard: SchedulingGuard,
        bus: Arc<dyn EventBus>,
        timeline: Arc<RwLock<PipelineTimeline>>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            configs,
            repository,
            resolver,
            guard,
            bus,
            timeline,
            queue: PipelineScheduleQueue::new(),
            ordering: StageOrderingEngine::new(),
            locks: Mutex::new(HashMap::new()),
            last_causes: RwLock::new(HashMap::new()),
            tick_interval,
        }
    }

    /// Rebuild in-memory state from persistence. Must run before the first
    /// tick: the timeline is replayed in its original natural order and the
    /// last build cause per pipeline is reloaded for change detection.
    pub async fn bootstrap(&self) -> Result<()> {
        let entries = self.repository.timeline_entries().await?;
        let replayed = PipelineTimeline::replay(entries)?;
        let entry_count = replayed.len();
        *self.timeline.write().await = replayed;

        let mut last_causes = self.last_causes.write().await;
        for config in self.configs.pipelines().await? {
            if let Some(instance) = self.repository.latest_instance(&config.name).await? {
                last_causes.insert(config.name.clone(), instance.build_cause);
            }
        }
        info!(entries = entry_count, "timeline replayed");
        Ok(())
    }

    /// Spawn the periodic scheduling loop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(err) = self.tick().await {
                    warn!(%err, "scheduling tick failed");
                }
            }
        })
    }

    /// One pass over all configured pipelines. Per-pipeline failures are
    /// contained: a broken material on one pipeline never stops the others.
    pub async fn tick(&self) -> Result<()> {
        if !self.guard.can_schedule_stage().await {
            warn!("scheduling paused by storage guard");
            return Ok(());
        }
        for config in self.configs.pipelines().await? {
            if let Err(err) = self
                .schedule_pipeline(&config, TriggerKind::Modification)
                .await
            {
                if err.is_transient() {
                    debug!(pipeline = %config.name, %err, "pipeline not schedulable this tick");
                } else {
                    warn!(pipeline = %config.name, %err, "pipeline scheduling failed");
                }
            }
        }
        Ok(())
    }

    /// Timer-driven trigger for a single pipeline, same resolution path as
    /// the modification tick but recorded with a timer trigger kind.
    pub async fn timer_trigger(&self, pipeline: &str) -> Result<()> {
        if !self.guard.can_schedule_stage().await {
            warn!(pipeline, "timer trigger skipped, scheduling paused");
            return Ok(());
        }
        let config = self
            .configs
            .pipeline(pipeline)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(pipeline.to_string()))?;
        self.schedule_pipeline(&config, TriggerKind::Timer).await
    }

    async fn schedule_pipeline(&self, config: &PipelineConfig, trigger: TriggerKind) -> Result<()> {
        let lock = self.pipeline_lock(&config.name);
        let _exclusive = lock.lock().await;

        let last = self.last_causes.read().await.get(&config.name).cloned();
        if let Some(cause) = self
            .resolver
            .resolve_automatic(config, last.as_ref(), trigger)
            .await?
        {
            self.queue.offer(&config.name, cause);
        }
        if self.queue.has_build_cause(&config.name) {
            self.create_from_queue(config).await?;
        }
        Ok(())
    }

    /// Consume the pending build cause and turn it into an instance.
    async fn create_from_queue(&self, config: &PipelineConfig) -> Result<Option<u64>> {
        let Some(cause) = self.queue.consume(&config.name) else {
            return Ok(None);
        };
        match self.create_instance(config, &cause).await {
            Ok(counter) => {
                self.queue.finish(&config.name);
                self.last_causes
                    .write()
                    .await
                    .insert(config.name.clone(), cause);
                Ok(Some(counter))
            }
            Err(err) => {
                // The cause is dropped; the next resolution recomputes it.
                self.queue.abort(&config.name);
                Err(err)
            }
        }
    }

    async fn create_instance(&self, config: &PipelineConfig, cause: &BuildCause) -> Result<u64> {
        let counter = self.repository.next_counter(&config.name).await?;
        let first_stage = self.ordering.first_stage(config)?;
        let stage_name = first_stage.name.clone();
        let order_id = first_stage.order_id;
        let instance = PipelineInstance::new(config, counter, cause.clone(), first_stage);

        // The entry becomes visible to fan-in only after the repository
        // commit succeeds; the write guard spans both so natural order is
        // assigned exactly once.
        let mut timeline = self.timeline.write().await;
        let entry = TimelineEntry {
            pipeline: config.name.clone(),
            counter,
            natural_order: timeline.len() as u64,
            revisions: resolved_revisions(cause),
            scheduled_at: Utc::now(),
        };
        self.repository.create_instance(&instance, &entry).await?;
        timeline.append(
            entry.pipeline.clone(),
            entry.counter,
            entry.revisions.clone(),
            entry.scheduled_at,
        )?;
        drop(timeline);

        info!(
            pipeline = %config.name,
            counter,
            trigger = ?cause.trigger,
            "instance created"
        );
        self.bus
            .publish(Event::InstanceCreated(InstanceCreatedPayload {
                instance_id: instance.id,
                pipeline: config.name.clone(),
                counter,
                trigger: cause.trigger,
                approver: cause.approver.clone(),
                created_at: instance.created_at,
            }))
            .await?;
        self.bus
            .publish(Event::StageScheduled(StageScheduledPayload {
                pipeline: config.name.clone(),
                counter,
                stage: stage_name,
                order_id,
                rerun: false,
            }))
            .await?;
        Ok(counter)
    }

    /// Manual pipeline trigger, optionally pinning materials to requested
    /// revisions. Returns the new counter on success.
    pub async fn trigger_pipeline(
        &self,
        pipeline: &str,
        user: &str,
        overrides: Option<&HashMap<String, Revision>>,
    ) -> Result<OperationResult<u64>> {
        match self.guard.check_operate(user, pipeline, None).await? {
            OperationStatus::Ok => {}
            OperationStatus::NotFound => {
                return Ok(OperationResult::not_found(format!(
                    "Pipeline {} not found",
                    pipeline
                )));
            }
            _ => {
                return Ok(OperationResult::forbidden(format!(
                    "User {} may not operate pipeline {}",
                    user, pipeline
                )));
            }
        }
        if !self.guard.can_trigger_manual_pipeline().await {
            return Ok(OperationResult::validation_failed(
                "Scheduling is paused: insufficient disk space",
            ));
        }
        let Some(config) = self.configs.pipeline(pipeline).await? else {
            return Ok(OperationResult::not_found(format!(
                "Pipeline {} not found",
                pipeline
            )));
        };

        let lock = self.pipeline_lock(pipeline);
        let _exclusive = lock.lock().await;

        let last = self.last_causes.read().await.get(pipeline).cloned();
        let cause = match self
            .resolver
            .resolve_manual(&config, last.as_ref(), user, overrides)
            .await
        {
            Ok(cause) => cause,
            Err(err @ Error::UnknownRevision { .. }) => {
                return Ok(OperationResult::validation_failed(err.to_string()));
            }
            Err(err) if err.is_transient() => {
                return Ok(OperationResult::validation_failed(err.to_string()));
            }
            Err(err) => return Err(err),
        };

        if !self.queue.offer(pipeline, cause) {
            return Ok(OperationResult::validation_failed(format!(
                "Pipeline {} is already being scheduled",
                pipeline
            )));
        }
        match self.create_from_queue(&config).await? {
            Some(counter) => Ok(OperationResult::ok(
                format!("Scheduled {}/{}", pipeline, counter),
                counter,
            )),
            None => Ok(OperationResult::validation_failed(format!(
                "Pipeline {} has no build cause to schedule",
                pipeline
            ))),
        }
    }

    /// Manual rerun of a stage in an existing instance. The rerun keeps the
    /// stage's original order id. Returns that order id on success.
    pub async fn rerun_stage(
        &self,
        pipeline: &str,
        counter: u64,
        stage: &str,
        user: &str,
    ) -> Result<OperationResult<u64>> {
        match self.guard.check_operate(user, pipeline, Some(stage)).await? {
            OperationStatus::Ok => {}
            OperationStatus::NotFound => {
                return Ok(OperationResult::not_found(format!(
                    "Stage {}/{} not found",
                    pipeline, stage
                )));
            }
            _ => {
                return Ok(OperationResult::forbidden(format!(
                    "User {} may not operate pipeline {}",
                    user, pipeline
                )));
            }
        }
        if !self.guard.can_schedule_stage().await {
            return Ok(OperationResult::validation_failed(
                "Scheduling is paused: insufficient disk space",
            ));
        }

        let lock = self.pipeline_lock(pipeline);
        let _exclusive = lock.lock().await;

        let Some(mut instance) = self.repository.instance(pipeline, counter).await? else {
            return Ok(OperationResult::not_found(format!(
                "Pipeline instance {}/{} not found",
                pipeline, counter
            )));
        };
        let Some(config) = self.configs.pipeline(pipeline).await? else {
            return Ok(OperationResult::not_found(format!(
                "Pipeline {} not found",
                pipeline
            )));
        };
        let Some(stage_config) = config.stage(stage) else {
            return Ok(OperationResult::not_found(format!(
                "Stage {}/{} not found",
                pipeline, stage
            )));
        };

        let rerun = match self.ordering.rerun(&instance, stage_config, user) {
            Ok(rerun) => rerun,
            Err(err @ Error::AlreadyInProgress { .. }) => {
                return Ok(OperationResult::validation_failed(err.to_string()));
            }
            Err(err @ Error::StageNotFound { .. }) => {
                return Ok(OperationResult::not_found(err.to_string()));
            }
            Err(err) => return Err(err),
        };
        let order_id = rerun.order_id;
        instance.stages.push(rerun);
        instance.state = InstanceState::Active;
        self.repository.update_instance(&instance).await?;

        info!(pipeline, counter, stage, user, "stage rerun scheduled");
        self.bus
            .publish(Event::StageScheduled(StageScheduledPayload {
                pipeline: pipeline.to_string(),
                counter,
                stage: stage.to_string(),
                order_id,
                rerun: true,
            }))
            .await?;
        Ok(OperationResult::ok(
            format!("Rerunning {}/{}/{}", pipeline, counter, stage),
            order_id,
        ))
    }

    /// Cancel an active stage. Its jobs stop being dispatchable immediately,
    /// and since a cancelled stage never schedules a follow-on, the run is
    /// over until a rerun revives it.
    pub async fn cancel_stage(
        &self,
        pipeline: &str,
        counter: u64,
        stage: &str,
        user: &str,
    ) -> Result<OperationResult<()>> {
        match self.guard.check_operate(user, pipeline, Some(stage)).await? {
            OperationStatus::Ok => {}
            OperationStatus::NotFound => {
                return Ok(OperationResult::not_found(format!(
                    "Stage {}/{} not found",
                    pipeline, stage
                )));
            }
            _ => {
                return Ok(OperationResult::forbidden(format!(
                    "User {} may not operate pipeline {}",
                    user, pipeline
                )));
            }
        }

        let lock = self.pipeline_lock(pipeline);
        let _exclusive = lock.lock().await;

        let Some(mut instance) = self.repository.instance(pipeline, counter).await? else {
            return Ok(OperationResult::not_found(format!(
                "Pipeline instance {}/{} not found",
                pipeline, counter
            )));
        };
        let Some(target) = instance.stage_mut(stage) else {
            return Ok(OperationResult::not_found(format!(
                "Stage {}/{}/{} has not run",
                pipeline, counter, stage
            )));
        };
        if !target.is_active() {
            return Ok(OperationResult::validation_failed(format!(
                "Stage {}/{}/{} is not active",
                pipeline, counter, stage
            )));
        }
        target.complete(StageResult::Cancelled);
        instance.state = InstanceState::Completed;
        self.repository.update_instance(&instance).await?;

        info!(pipeline, counter, stage, user, "stage cancelled");
        self.bus
            .publish(Event::StageCompleted(StageCompletedPayload {
                pipeline: pipeline.to_string(),
                counter,
                stage: stage.to_string(),
                result: StageResult::Cancelled,
            }))
            .await?;
        self.bus
            .publish(Event::InstanceCompleted(InstanceCompletedPayload {
                instance_id: instance.id,
                pipeline: pipeline.to_string(),
                counter,
                passed: false,
            }))
            .await?;
        Ok(OperationResult::ok(
            format!("Cancelled {}/{}/{}", pipeline, counter, stage),
            (),
        ))
    }

    /// Cancel a whole instance. Every active stage completes as cancelled
    /// and in-flight assignments observe the cancellation on their next
    /// compare-and-set.
    pub async fn cancel_instance(
        &self,
        pipeline: &str,
        counter: u64,
        user: &str,
    ) -> Result<OperationResult<()>> {
        match self.guard.check_operate(user, pipeline, None).await? {
            OperationStatus::Ok => {}
            OperationStatus::NotFound => {
                return Ok(OperationResult::not_found(format!(
                    "Pipeline {} not found",
                    pipeline
                )));
            }
            _ => {
                return Ok(OperationResult::forbidden(format!(
                    "User {} may not operate pipeline {}",
                    user, pipeline
                )));
            }
        }

        let lock = self.pipeline_lock(pipeline);
        let _exclusive = lock.lock().await;

        let Some(mut instance) = self.repository.instance(pipeline, counter).await? else {
            return Ok(OperationResult::not_found(format!(
                "Pipeline instance {}/{} not found",
                pipeline, counter
            )));
        };
        if instance.state != InstanceState::Active {
            return Ok(OperationResult::validation_failed(format!(
                "Pipeline instance {}/{} is not active",
                pipeline, counter
            )));
        }

        let cancelled_stages: Vec<String> = instance
            .stages
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.name.clone())
            .collect();
        instance.cancel();
        self.repository.update_instance(&instance).await?;

        info!(pipeline, counter, user, "instance cancelled");
        for stage in cancelled_stages {
            self.bus
                .publish(Event::StageCompleted(StageCompletedPayload {
                    pipeline: pipeline.to_string(),
                    counter,
                    stage,
                    result: StageResult::Cancelled,
                }))
                .await?;
        }
        self.bus
            .publish(Event::InstanceCompleted(InstanceCompletedPayload {
                instance_id: instance.id,
                pipeline: pipeline.to_string(),
                counter,
                passed: false,
            }))
            .await?;
        Ok(OperationResult::ok(
            format!("Cancelled {}/{}", pipeline, counter),
            (),
        ))
    }

    /// Record one job finishing. Stage completion is reported separately by
    /// the boundary once it has aggregated job results.
    pub async fn job_completed(&self, pipeline: &str, counter: u64, job_id: JobId) -> Result<()> {
        let lock = self.pipeline_lock(pipeline);
        let _exclusive = lock.lock().await;

        let mut instance = self
            .repository
            .instance(pipeline, counter)
            .await?
            .ok_or(Error::InstanceNotFound {
                pipeline: pipeline.to_string(),
                counter,
            })?;
        let job = instance
            .find_job_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        job.complete();
        let stage = instance
            .stages
            .iter()
            .find(|s| s.job(job_id).is_some())
            .map(|s| s.name.clone())
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        self.repository.complete_job(job_id).await?;
        self.repository.update_instance(&instance).await?;
        self.bus
            .publish(Event::JobCompleted(JobCompletedPayload {
                job_id,
                pipeline: pipeline.to_string(),
                counter,
                stage,
            }))
            .await?;
        Ok(())
    }

    /// Record a stage result and progress the instance: a passed stage
    /// schedules the next declared stage, a passed last stage completes the
    /// instance, a failed or cancelled stage ends it without follow-on.
    pub async fn stage_completed(
        &self,
        pipeline: &str,
        counter: u64,
        stage: &str,
        result: StageResult,
    ) -> Result<()> {
        let lock = self.pipeline_lock(pipeline);
        let _exclusive = lock.lock().await;

        let mut instance = self
            .repository
            .instance(pipeline, counter)
            .await?
            .ok_or(Error::InstanceNotFound {
                pipeline: pipeline.to_string(),
                counter,
            })?;
        let target = instance.stage_mut(stage).ok_or(Error::StageNotFound {
            pipeline: pipeline.to_string(),
            stage: stage.to_string(),
        })?;
        target.complete(result);

        let follow_on = if result == StageResult::Passed {
            let config = self
                .configs
                .pipeline(pipeline)
                .await?
                .ok_or_else(|| Error::PipelineNotFound(pipeline.to_string()))?;
            self.ordering.follow_on(&instance, &config, stage)
        } else {
            None
        };

        let completed_event = Event::StageCompleted(StageCompletedPayload {
            pipeline: pipeline.to_string(),
            counter,
            stage: stage.to_string(),
            result,
        });

        if let Some(next) = follow_on {
            if self.guard.can_schedule_stage().await {
                let payload = StageScheduledPayload {
                    pipeline: pipeline.to_string(),
                    counter,
                    stage: next.name.clone(),
                    order_id: next.order_id,
                    rerun: false,
                };
                instance.stages.push(next);
                self.repository.update_instance(&instance).await?;
                self.bus.publish(completed_event).await?;
                self.bus.publish(Event::StageScheduled(payload)).await?;
            } else {
                // The instance stays active; a later rerun picks it back up.
                warn!(pipeline, counter, stage, "follow-on stage blocked by storage guard");
                self.repository.update_instance(&instance).await?;
                self.bus.publish(completed_event).await?;
            }
            return Ok(());
        }

        instance.state = InstanceState::Completed;
        self.repository.update_instance(&instance).await?;
        self.bus.publish(completed_event).await?;
        self.bus
            .publish(Event::InstanceCompleted(InstanceCompletedPayload {
                instance_id: instance.id,
                pipeline: pipeline.to_string(),
                counter,
                passed: result == StageResult::Passed,
            }))
            .await?;
        Ok(())
    }

    fn pipeline_lock(&self, pipeline: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("pipeline lock registry poisoned")
            .entry(pipeline.to_string())
            .or_default()
            .clone()
    }
}

fn resolved_revisions(cause: &BuildCause) -> Vec<ResolvedRevision> {
    cause
        .material_revisions
        .iter()
        .filter_map(|revision| {
            let tip = revision.latest()?;
            Some(ResolvedRevision {
                material_fingerprint: revision.material.fingerprint(),
                revision: tip.revision.clone(),
                modified_at: tip.modified_at,
            })
        })
        .collect()
}
