//! Work dispatch to polling agents.
//!
//! Each agent poll answers with either a build-work descriptor or an explicit
//! no-work marker, never an error for "nothing to do". Selection is oldest
//! enqueued first under resource, environment, licensing, and remote-capacity
//! constraints; the state transition itself is a compare-and-set through the
//! repository so concurrent polls cannot double-assign a job.
//!
//! Remote capacity is a reservation ledger: a slot is taken under the ledger
//! lock before the assignment commits and handed back when the assignment
//! loses, when the job completes, or when a completed/cancelled stage retires
//! its jobs wholesale.

use futures::StreamExt;
use gantry_core::agent::{AgentLiveness, AgentSnapshot};
use gantry_core::events::{AgentStatusChangedPayload, Event, JobAssignedPayload};
use gantry_core::ids::{AgentId, JobId};
use gantry_core::ports::{
    AssignOutcome, EditionProvider, EditionTier, EventBus, InstanceRepository,
    PipelineConfigSource, RunnableJob,
};
use gantry_core::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Response to an agent poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Work {
    NoWork,
    Build(BuildWork),
}

/// Descriptor handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildWork {
    pub job_id: JobId,
    pub pipeline: String,
    pub counter: u64,
    pub stage: String,
    pub stage_order: u64,
    pub job_name: String,
    /// Build plan reference in `pipeline/counter/stage/job` form.
    pub build_plan: String,
}

impl BuildWork {
    fn from_job(job: &RunnableJob) -> Self {
        Self {
            job_id: job.job_id,
            pipeline: job.pipeline.clone(),
            counter: job.counter,
            stage: job.stage.clone(),
            stage_order: job.stage_order,
            job_name: job.job_name.clone(),
            build_plan: format!(
                "{}/{}/{}/{}",
                job.pipeline, job.counter, job.stage, job.job_name
            ),
        }
    }
}

/// One occupied remote-capacity slot, addressable by the stage that owns
/// the job so stage-level completion can retire it.
#[derive(Debug, Clone)]
struct RemoteSlot {
    pipeline: String,
    counter: u64,
    stage: String,
}

pub struct AgentWorkDispatcher {
    repository: Arc<dyn InstanceRepository>,
    configs: Arc<dyn PipelineConfigSource>,
    edition: Arc<dyn EditionProvider>,
    bus: Arc<dyn EventBus>,
    remote_cap: usize,
    /// Jobs currently assigned to remote agents, for the concurrency cap.
    remote_assignments: Mutex<HashMap<JobId, RemoteSlot>>,
    /// Last liveness each agent reported, for status-change events.
    agent_liveness: Mutex<HashMap<AgentId, AgentLiveness>>,
}

impl AgentWorkDispatcher {
    pub fn new(
        repository: Arc<dyn InstanceRepository>,
        configs: Arc<dyn PipelineConfigSource>,
        edition: Arc<dyn EditionProvider>,
        bus: Arc<dyn EventBus>,
        remote_cap: usize,
    ) -> Self {
        Self {
            repository,
            configs,
            edition,
            bus,
            remote_cap,
            remote_assignments: Mutex::new(HashMap::new()),
            agent_liveness: Mutex::new(HashMap::new()),
        }
    }

    /// Follow completion events so remote-capacity slots are released even
    /// when a stage cancellation force-completes its jobs without per-job
    /// events.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut events = match self.bus.subscribe(">").await {
                Ok(events) => events,
                Err(err) => {
                    warn!(%err, "dispatcher cannot observe completion events");
                    return;
                }
            };
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => self.observe(&event),
                    Err(err) => warn!(%err, "completion event stream error"),
                }
            }
        })
    }

    /// Apply one event to the remote-capacity ledger.
    pub fn observe(&self, event: &Event) {
        match event {
            Event::JobCompleted(payload) => self.release_job(payload.job_id),
            Event::StageCompleted(payload) => {
                self.release_stage(&payload.pipeline, payload.counter, &payload.stage)
            }
            _ => {}
        }
    }

    /// One dispatch cycle for a polling agent.
    pub async fn assign_work(&self, agent: &AgentSnapshot) -> Result<Work> {
        self.note_liveness(agent).await?;
        if !agent.is_available() {
            return Ok(Work::NoWork);
        }

        let remote = agent.is_remote();
        if remote && self.remote_assignment_count() >= self.remote_cap {
            debug!(agent = %agent.id, "remote concurrency cap reached");
            return Ok(Work::NoWork);
        }

        // On restricted editions only the first configured group may run on
        // remote agents; everything else is bounded to local capacity.
        let licensed_group = if remote && self.edition.edition() == EditionTier::Restricted {
            self.configs.pipelines().await?.first().map(|p| p.group.clone())
        } else {
            None
        };

        let mut jobs = self.repository.runnable_jobs().await?;
        jobs.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));

        for job in &jobs {
            if !self.eligible(agent, job, licensed_group.as_deref()) {
                continue;
            }
            // The slot is reserved before the compare-and-set so two remote
            // polls racing at cap - 1 cannot both clear the cap check.
            if remote && !self.try_reserve(job) {
                debug!(agent = %agent.id, "remote concurrency cap reached");
                return Ok(Work::NoWork);
            }

            match self.repository.try_assign_job(job.job_id, agent.id).await {
                Ok(AssignOutcome::Assigned) => {
                    info!(
                        job = %job.job_id,
                        agent = %agent.id,
                        pipeline = %job.pipeline,
                        stage = %job.stage,
                        "assigned work"
                    );
                    self.bus
                        .publish(Event::JobAssigned(JobAssignedPayload {
                            job_id: job.job_id,
                            agent_id: agent.id,
                            pipeline: job.pipeline.clone(),
                            counter: job.counter,
                            stage: job.stage.clone(),
                        }))
                        .await?;
                    return Ok(Work::Build(BuildWork::from_job(job)));
                }
                // Lost the compare-and-set or the instance was cancelled
                // between selection and bind; retry selection in this cycle.
                Ok(AssignOutcome::AlreadyTaken | AssignOutcome::InstanceCancelled) => {
                    if remote {
                        self.release_job(job.job_id);
                    }
                    debug!(job = %job.job_id, "assignment rolled back, reselecting");
                    continue;
                }
                Err(err) => {
                    if remote {
                        self.release_job(job.job_id);
                    }
                    return Err(err);
                }
            }
        }

        Ok(Work::NoWork)
    }

    /// Hand back the remote-capacity slot held by one job.
    pub fn release_job(&self, job_id: JobId) {
        self.remote_assignments
            .lock()
            .expect("remote assignment lock poisoned")
            .remove(&job_id);
    }

    pub fn remote_assignment_count(&self) -> usize {
        self.remote_assignments
            .lock()
            .expect("remote assignment lock poisoned")
            .len()
    }

    fn release_stage(&self, pipeline: &str, counter: u64, stage: &str) {
        self.remote_assignments
            .lock()
            .expect("remote assignment lock poisoned")
            .retain(|_, slot| {
                slot.pipeline != pipeline || slot.counter != counter || slot.stage != stage
            });
    }

    fn try_reserve(&self, job: &RunnableJob) -> bool {
        let mut ledger = self
            .remote_assignments
            .lock()
            .expect("remote assignment lock poisoned");
        if ledger.len() >= self.remote_cap {
            return false;
        }
        ledger.insert(
            job.job_id,
            RemoteSlot {
                pipeline: job.pipeline.clone(),
                counter: job.counter,
                stage: job.stage.clone(),
            },
        );
        true
    }

    async fn note_liveness(&self, agent: &AgentSnapshot) -> Result<()> {
        let previous = self
            .agent_liveness
            .lock()
            .expect("agent liveness lock poisoned")
            .insert(agent.id, agent.liveness);
        if let Some(from) = previous
            && from != agent.liveness
        {
            info!(agent = %agent.id, ?from, to = ?agent.liveness, "agent liveness changed");
            self.bus
                .publish(Event::AgentStatusChanged(AgentStatusChangedPayload {
                    agent_id: agent.id,
                    from,
                    to: agent.liveness,
                }))
                .await?;
        }
        Ok(())
    }

    fn eligible(&self, agent: &AgentSnapshot, job: &RunnableJob, licensed_group: Option<&str>) -> bool {
        if !agent.has_resources(&job.resources) {
            return false;
        }
        if !agent.serves_environment(job.environment.as_deref()) {
            return false;
        }
        if let Some(group) = licensed_group
            && job.group != group
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use gantry_bus::BroadcastBus;
    use gantry_core::agent::AgentOrigin;
    use gantry_core::events::StageCompletedPayload;
    use gantry_core::instance::{PipelineInstance, StageResult};
    use gantry_core::material::Material;
    use gantry_core::pipeline::PipelineConfig;
    use gantry_core::timeline::TimelineEntry;
    use gantry_core::Error;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockRepository {
        jobs: Mutex<Vec<RunnableJob>>,
        assigned: Mutex<HashSet<JobId>>,
        cancelled_instances: Mutex<HashSet<(String, u64)>>,
        /// Ledger size seen inside `try_assign_job`, for reservation checks.
        ledger_at_assign: AtomicUsize,
        dispatcher: Mutex<Option<Arc<AgentWorkDispatcher>>>,
        refuse_assignments: bool,
    }

    impl MockRepository {
        fn new(jobs: Vec<RunnableJob>) -> Self {
            Self {
                jobs: Mutex::new(jobs),
                assigned: Mutex::new(HashSet::new()),
                cancelled_instances: Mutex::new(HashSet::new()),
                ledger_at_assign: AtomicUsize::new(0),
                dispatcher: Mutex::new(None),
                refuse_assignments: false,
            }
        }

        fn cancel(&self, pipeline: &str, counter: u64) {
            self.cancelled_instances
                .lock()
                .unwrap()
                .insert((pipeline.to_string(), counter));
        }

        fn watch(&self, dispatcher: Arc<AgentWorkDispatcher>) {
            *self.dispatcher.lock().unwrap() = Some(dispatcher);
        }
    }

    #[async_trait]
    impl InstanceRepository for MockRepository {
        async fn next_counter(&self, _pipeline: &str) -> Result<u64> {
            Ok(1)
        }

        async fn create_instance(
            &self,
            _instance: &PipelineInstance,
            _timeline_entry: &TimelineEntry,
        ) -> Result<()> {
            Ok(())
        }

        async fn instance(
            &self,
            _pipeline: &str,
            _counter: u64,
        ) -> Result<Option<PipelineInstance>> {
            Ok(None)
        }

        async fn latest_instance(&self, _pipeline: &str) -> Result<Option<PipelineInstance>> {
            Ok(None)
        }

        async fn update_instance(&self, _instance: &PipelineInstance) -> Result<()> {
            Ok(())
        }

        async fn timeline_entries(&self) -> Result<Vec<TimelineEntry>> {
            Ok(vec![])
        }

        async fn runnable_jobs(&self) -> Result<Vec<RunnableJob>> {
            let assigned = self.assigned.lock().unwrap().clone();
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|j| !assigned.contains(&j.job_id))
                .cloned()
                .collect())
        }

        async fn try_assign_job(&self, job_id: JobId, _agent_id: AgentId) -> Result<AssignOutcome> {
            if let Some(dispatcher) = self.dispatcher.lock().unwrap().as_ref() {
                self.ledger_at_assign
                    .store(dispatcher.remote_assignment_count(), Ordering::SeqCst);
            }
            if self.refuse_assignments {
                return Ok(AssignOutcome::AlreadyTaken);
            }
            let jobs = self.jobs.lock().unwrap();
            let job = jobs
                .iter()
                .find(|j| j.job_id == job_id)
                .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
            if self
                .cancelled_instances
                .lock()
                .unwrap()
                .contains(&(job.pipeline.clone(), job.counter))
            {
                return Ok(AssignOutcome::InstanceCancelled);
            }
            if !self.assigned.lock().unwrap().insert(job_id) {
                return Ok(AssignOutcome::AlreadyTaken);
            }
            Ok(AssignOutcome::Assigned)
        }

        async fn complete_job(&self, _job_id: JobId) -> Result<()> {
            Ok(())
        }
    }

    struct StaticConfigs {
        pipelines: Vec<PipelineConfig>,
    }

    #[async_trait]
    impl PipelineConfigSource for StaticConfigs {
        async fn pipelines(&self) -> Result<Vec<PipelineConfig>> {
            Ok(self.pipelines.clone())
        }

        async fn pipeline(&self, name: &str) -> Result<Option<PipelineConfig>> {
            Ok(self.pipelines.iter().find(|p| p.name == name).cloned())
        }
    }

    struct StaticEdition(EditionTier);

    impl EditionProvider for StaticEdition {
        fn edition(&self) -> EditionTier {
            self.0
        }
    }

    fn job(pipeline: &str, group: &str, name: &str, age_secs: i64) -> RunnableJob {
        RunnableJob {
            job_id: JobId::new(),
            pipeline: pipeline.to_string(),
            counter: 1,
            group: group.to_string(),
            stage: "build".to_string(),
            stage_order: 1,
            job_name: name.to_string(),
            resources: vec![],
            environment: None,
            scheduled_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn agent(origin: AgentOrigin) -> AgentSnapshot {
        AgentSnapshot {
            id: AgentId::new(),
            hostname: "agent".to_string(),
            resources: vec![],
            environments: vec![],
            liveness: AgentLiveness::Idle,
            origin,
            last_heard_at: Some(Utc::now()),
        }
    }

    fn pipeline(name: &str, group: &str) -> PipelineConfig {
        PipelineConfig {
            name: name.to_string(),
            group: group.to_string(),
            materials: vec![Material::scm("m", "svn://m")],
            stages: vec![],
            environment: None,
        }
    }

    fn dispatcher_on(
        repository: Arc<MockRepository>,
        bus: Arc<BroadcastBus>,
        edition: EditionTier,
        remote_cap: usize,
    ) -> Arc<AgentWorkDispatcher> {
        Arc::new(AgentWorkDispatcher::new(
            repository,
            Arc::new(StaticConfigs {
                pipelines: vec![pipeline("first", "g1"), pipeline("second", "g2")],
            }),
            Arc::new(StaticEdition(edition)),
            bus,
            remote_cap,
        ))
    }

    fn dispatcher(
        repository: Arc<MockRepository>,
        edition: EditionTier,
        remote_cap: usize,
    ) -> Arc<AgentWorkDispatcher> {
        dispatcher_on(repository, Arc::new(BroadcastBus::new()), edition, remote_cap)
    }

    #[tokio::test]
    async fn test_oldest_job_first() {
        let repo = Arc::new(MockRepository::new(vec![
            job("first", "g1", "young", 10),
            job("first", "g1", "old", 100),
        ]));
        let dispatcher = dispatcher(repo, EditionTier::Unrestricted, 10);

        match dispatcher.assign_work(&agent(AgentOrigin::Local)).await.unwrap() {
            Work::Build(work) => assert_eq!(work.job_name, "old"),
            Work::NoWork => panic!("expected work"),
        }
    }

    #[tokio::test]
    async fn test_remote_cap_spares_local_agents() {
        let repo = Arc::new(MockRepository::new(vec![
            job("first", "g1", "a", 30),
            job("first", "g1", "b", 20),
            job("first", "g1", "c", 10),
        ]));
        let dispatcher = dispatcher(repo, EditionTier::Unrestricted, 1);

        let remote_one = dispatcher.assign_work(&agent(AgentOrigin::Remote)).await.unwrap();
        assert!(matches!(remote_one, Work::Build(_)));

        // Cap of one reached; the second remote poll gets nothing even
        // though eligible jobs remain.
        let remote_two = dispatcher.assign_work(&agent(AgentOrigin::Remote)).await.unwrap();
        assert_eq!(remote_two, Work::NoWork);

        // Local agents are never subject to the cap.
        let local = dispatcher.assign_work(&agent(AgentOrigin::Local)).await.unwrap();
        assert!(matches!(local, Work::Build(_)));

        // Releasing the remote slot lets the next remote poll through.
        if let Work::Build(work) = remote_one {
            dispatcher.release_job(work.job_id);
        }
        let remote_three = dispatcher.assign_work(&agent(AgentOrigin::Remote)).await.unwrap();
        assert!(matches!(remote_three, Work::Build(_)));
    }

    #[tokio::test]
    async fn test_stage_completion_event_releases_remote_slots() {
        let repo = Arc::new(MockRepository::new(vec![
            job("first", "g1", "a", 30),
            job("first", "g1", "b", 20),
        ]));
        let dispatcher = dispatcher(repo, EditionTier::Unrestricted, 1);

        let first = dispatcher.assign_work(&agent(AgentOrigin::Remote)).await.unwrap();
        assert!(matches!(first, Work::Build(_)));
        assert_eq!(dispatcher.remote_assignment_count(), 1);

        // A cancelled stage retires its jobs without per-job events; the
        // stage-level completion must hand the slot back.
        dispatcher.observe(&Event::StageCompleted(StageCompletedPayload {
            pipeline: "first".to_string(),
            counter: 1,
            stage: "build".to_string(),
            result: StageResult::Cancelled,
        }));
        assert_eq!(dispatcher.remote_assignment_count(), 0);

        let next = dispatcher.assign_work(&agent(AgentOrigin::Remote)).await.unwrap();
        assert!(matches!(next, Work::Build(_)));
    }

    #[tokio::test]
    async fn test_cap_slot_reserved_before_assignment_commits() {
        let mut repo = MockRepository::new(vec![job("first", "g1", "a", 10)]);
        repo.refuse_assignments = true;
        let repo = Arc::new(repo);
        let dispatcher = dispatcher(repo.clone(), EditionTier::Unrestricted, 1);
        repo.watch(dispatcher.clone());

        let outcome = dispatcher.assign_work(&agent(AgentOrigin::Remote)).await.unwrap();
        assert_eq!(outcome, Work::NoWork);

        // The slot was held during the compare-and-set and handed back when
        // the assignment lost.
        assert_eq!(repo.ledger_at_assign.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.remote_assignment_count(), 0);
    }

    #[tokio::test]
    async fn test_restricted_edition_keeps_later_groups_off_remote_agents() {
        let repo = Arc::new(MockRepository::new(vec![job("second", "g2", "j", 10)]));
        let dispatcher = dispatcher(repo, EditionTier::Restricted, 10);

        let remote = dispatcher.assign_work(&agent(AgentOrigin::Remote)).await.unwrap();
        assert_eq!(remote, Work::NoWork);

        let local = dispatcher.assign_work(&agent(AgentOrigin::Local)).await.unwrap();
        assert!(matches!(local, Work::Build(_)));
    }

    #[tokio::test]
    async fn test_resource_and_environment_constraints() {
        let mut tagged = job("first", "g1", "needs-linux", 10);
        tagged.resources = vec!["linux".to_string()];
        let mut scoped = job("first", "g1", "uat-only", 5);
        scoped.environment = Some("uat".to_string());
        let repo = Arc::new(MockRepository::new(vec![tagged, scoped]));
        let dispatcher = dispatcher(repo, EditionTier::Unrestricted, 10);

        // Bare agent matches neither job.
        let bare = dispatcher.assign_work(&agent(AgentOrigin::Local)).await.unwrap();
        assert_eq!(bare, Work::NoWork);

        let mut linux = agent(AgentOrigin::Local);
        linux.resources = vec!["linux".to_string()];
        match dispatcher.assign_work(&linux).await.unwrap() {
            Work::Build(work) => assert_eq!(work.job_name, "needs-linux"),
            Work::NoWork => panic!("expected work"),
        }

        let mut uat = agent(AgentOrigin::Local);
        uat.environments = vec!["uat".to_string()];
        match dispatcher.assign_work(&uat).await.unwrap() {
            Work::Build(work) => assert_eq!(work.job_name, "uat-only"),
            Work::NoWork => panic!("expected work"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_instance_rolls_back_and_reselects() {
        let repo = Arc::new(MockRepository::new(vec![
            job("doomed", "g1", "a", 100),
            job("first", "g1", "b", 10),
        ]));
        repo.cancel("doomed", 1);
        let dispatcher = dispatcher(repo, EditionTier::Unrestricted, 10);

        match dispatcher.assign_work(&agent(AgentOrigin::Local)).await.unwrap() {
            Work::Build(work) => assert_eq!(work.job_name, "b"),
            Work::NoWork => panic!("expected work"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_instance_does_not_strand_remote_slot() {
        let repo = Arc::new(MockRepository::new(vec![job("doomed", "g1", "a", 10)]));
        repo.cancel("doomed", 1);
        let dispatcher = dispatcher(repo, EditionTier::Unrestricted, 1);

        let outcome = dispatcher.assign_work(&agent(AgentOrigin::Remote)).await.unwrap();
        assert_eq!(outcome, Work::NoWork);
        assert_eq!(dispatcher.remote_assignment_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_agent_gets_no_work() {
        let repo = Arc::new(MockRepository::new(vec![job("first", "g1", "a", 10)]));
        let dispatcher = dispatcher(repo, EditionTier::Unrestricted, 10);

        let mut disabled = agent(AgentOrigin::Local);
        disabled.liveness = AgentLiveness::Disabled;
        assert_eq!(dispatcher.assign_work(&disabled).await.unwrap(), Work::NoWork);

        let mut lost = agent(AgentOrigin::Remote);
        lost.liveness = AgentLiveness::LostContact;
        assert_eq!(dispatcher.assign_work(&lost).await.unwrap(), Work::NoWork);
    }

    #[tokio::test]
    async fn test_liveness_transition_publishes_status_event() {
        let repo = Arc::new(MockRepository::new(vec![]));
        let bus = Arc::new(BroadcastBus::new());
        let dispatcher = dispatcher_on(repo, bus.clone(), EditionTier::Unrestricted, 10);
        let mut events = bus.subscribe("agent.>").await.unwrap();

        let mut polling = agent(AgentOrigin::Local);
        dispatcher.assign_work(&polling).await.unwrap();

        // Same agent comes back building: one transition event.
        polling.liveness = AgentLiveness::Building;
        dispatcher.assign_work(&polling).await.unwrap();

        match events.next().await {
            Some(Ok(Event::AgentStatusChanged(p))) => {
                assert_eq!(p.agent_id, polling.id);
                assert_eq!(p.from, AgentLiveness::Idle);
                assert_eq!(p.to, AgentLiveness::Building);
            }
            other => panic!("expected status event, got {:?}", other.map(|r| r.is_ok())),
        }
    }
}
