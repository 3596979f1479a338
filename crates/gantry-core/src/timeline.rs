//! The global pipeline-instance timeline.
//!
//! An append-only, strictly ordered sequence covering every instance ever
//! scheduled across all pipelines. It is the authority fan-in resolution uses
//! to pick a consistent upstream instance. Entries are never reordered or
//! deleted; counters per pipeline are strictly increasing.
//!
//! The timeline starts empty at boot and is rebuilt by replaying persisted
//! instances in their original natural order.

use crate::error::{Error, Result};
use crate::material::Revision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One material revision as resolved into a scheduled instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRevision {
    pub material_fingerprint: String,
    pub revision: Revision,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub pipeline: String,
    pub counter: u64,
    /// Global scheduling order across all pipelines.
    pub natural_order: u64,
    pub revisions: Vec<ResolvedRevision>,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PipelineTimeline {
    entries: Vec<Arc<TimelineEntry>>,
    by_pipeline: HashMap<String, Vec<Arc<TimelineEntry>>>,
    next_natural: u64,
}

impl PipelineTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries. Entries must arrive in their original
    /// natural order; per-pipeline counter monotonicity is re-checked.
    pub fn replay(entries: impl IntoIterator<Item = TimelineEntry>) -> Result<Self> {
        let mut timeline = Self::new();
        for entry in entries {
            timeline.append(
                entry.pipeline,
                entry.counter,
                entry.revisions,
                entry.scheduled_at,
            )?;
        }
        Ok(timeline)
    }

    /// Append a newly scheduled instance. Fails if the counter does not
    /// strictly increase for the pipeline.
    pub fn append(
        &mut self,
        pipeline: String,
        counter: u64,
        revisions: Vec<ResolvedRevision>,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Arc<TimelineEntry>> {
        if let Some(latest) = self.latest(&pipeline)
            && latest.counter >= counter
        {
            return Err(Error::TimelineOrder { pipeline, counter });
        }

        let entry = Arc::new(TimelineEntry {
            pipeline: pipeline.clone(),
            counter,
            natural_order: self.next_natural,
            revisions,
            scheduled_at,
        });
        self.next_natural += 1;
        self.entries.push(entry.clone());
        self.by_pipeline.entry(pipeline).or_default().push(entry.clone());
        Ok(entry)
    }

    pub fn latest(&self, pipeline: &str) -> Option<Arc<TimelineEntry>> {
        self.by_pipeline
            .get(pipeline)
            .and_then(|entries| entries.last())
            .cloned()
    }

    pub fn entry(&self, pipeline: &str, counter: u64) -> Option<Arc<TimelineEntry>> {
        self.by_pipeline.get(pipeline).and_then(|entries| {
            entries
                .binary_search_by_key(&counter, |e| e.counter)
                .ok()
                .map(|i| entries[i].clone())
        })
    }

    /// Instances of `pipeline` scheduled after `counter` (exclusive), ordered
    /// by counter ascending.
    pub fn completed_since(&self, pipeline: &str, counter: u64) -> Vec<Arc<TimelineEntry>> {
        self.by_pipeline
            .get(pipeline)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.counter > counter)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
