//! Per-pipeline serialization of pending build causes.
//!
//! At most one build cause is pending per pipeline name at any instant, and a
//! consumed cause is never handed out twice. Offers are last-write-wins while
//! the entry is unconsumed; once instance creation has picked an entry up,
//! offers for that pipeline are rejected until creation finishes or aborts.

use gantry_core::build_cause::BuildCause;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
pub struct PipelineScheduleQueue {
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<String, BuildCause>,
    consuming: HashSet<String>,
}

impl PipelineScheduleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the pending entry. Returns false when the current
    /// entry is being consumed by instance creation.
    pub fn offer(&self, pipeline: &str, cause: BuildCause) -> bool {
        let mut state = self.state.lock().expect("schedule queue lock poisoned");
        if state.consuming.contains(pipeline) {
            debug!(pipeline, "offer rejected, build cause being consumed");
            return false;
        }
        state.pending.insert(pipeline.to_string(), cause);
        true
    }

    /// Observability query.
    pub fn has_build_cause(&self, pipeline: &str) -> bool {
        self.state
            .lock()
            .expect("schedule queue lock poisoned")
            .pending
            .contains_key(pipeline)
    }

    /// Atomically remove and return the pending entry, marking the pipeline
    /// as consuming until `finish` or `abort`.
    pub fn consume(&self, pipeline: &str) -> Option<BuildCause> {
        let mut state = self.state.lock().expect("schedule queue lock poisoned");
        let cause = state.pending.remove(pipeline)?;
        state.consuming.insert(pipeline.to_string());
        Some(cause)
    }

    /// Instance creation committed; new offers may arrive.
    pub fn finish(&self, pipeline: &str) {
        self.state
            .lock()
            .expect("schedule queue lock poisoned")
            .consuming
            .remove(pipeline);
    }

    /// Instance creation failed; the cause is gone (the next resolution will
    /// recompute it) and new offers may arrive.
    pub fn abort(&self, pipeline: &str) {
        self.finish(pipeline);
    }

    pub fn pending_pipelines(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .expect("schedule queue lock poisoned")
            .pending
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
