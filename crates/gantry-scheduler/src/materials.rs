//! Material revision resolution.
//!
//! Answers "has this material changed since the revisions the pipeline last
//! built with". SCM materials poll the external change source under a bounded
//! timeout; dependency materials are answered from the pipeline timeline.
//! Failures are soft: the pipeline keeps its previous revisions and the
//! failure is surfaced as a health warning, not an error that stops the
//! scheduler.

use gantry_core::health::{HealthRegistry, HealthSeverity};
use gantry_core::material::{Material, MaterialRevision, Modification};
use gantry_core::ports::ChangeSource;
use gantry_core::timeline::PipelineTimeline;
use gantry_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Result of a material check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterialUpdate {
    Unchanged,
    /// New modifications since the last used revision, oldest first.
    Changed(Vec<Modification>),
}

pub struct MaterialRevisionResolver {
    change_source: Arc<dyn ChangeSource>,
    timeline: Arc<RwLock<PipelineTimeline>>,
    health: Arc<HealthRegistry>,
    timeout: Duration,
}

impl MaterialRevisionResolver {
    pub fn new(
        change_source: Arc<dyn ChangeSource>,
        timeline: Arc<RwLock<PipelineTimeline>>,
        health: Arc<HealthRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            change_source,
            timeline,
            health,
            timeout,
        }
    }

    /// Check one material against the revision set the pipeline last used.
    pub async fn resolve(
        &self,
        material: &Material,
        last: Option<&MaterialRevision>,
    ) -> Result<MaterialUpdate> {
        match material.upstream_pipeline() {
            Some(upstream) => self.resolve_dependency(material, upstream, last).await,
            None => self.resolve_scm(material, last).await,
        }
    }

    async fn resolve_dependency(
        &self,
        material: &Material,
        upstream: &str,
        last: Option<&MaterialRevision>,
    ) -> Result<MaterialUpdate> {
        let since = last.and_then(|l| l.upstream_counter()).unwrap_or(0);
        let timeline = self.timeline.read().await;
        let entries = timeline.completed_since(upstream, since);
        if entries.is_empty() {
            debug!(material = %material.name, upstream, since, "no new upstream instances");
            return Ok(MaterialUpdate::Unchanged);
        }

        let modifications = entries
            .iter()
            .map(|e| Modification::pipeline(upstream, e.counter, e.scheduled_at))
            .collect();
        Ok(MaterialUpdate::Changed(modifications))
    }

    async fn resolve_scm(
        &self,
        material: &Material,
        last: Option<&MaterialRevision>,
    ) -> Result<MaterialUpdate> {
        let since = last.and_then(|l| l.latest_revision());
        let health_key = material_health_key(material);

        let poll = self.change_source.poll_changes(material, since);
        let modifications = match tokio::time::timeout(self.timeout, poll).await {
            Ok(Ok(modifications)) => modifications,
            Ok(Err(err)) => {
                let error = Error::MaterialUnreachable {
                    material: material.name.clone(),
                    reason: err.to_string(),
                };
                warn!(material = %material.name, %err, "material check failed");
                self.health.update(
                    health_key,
                    HealthSeverity::Warning,
                    format!("Failed to check material {}: {}", material.name, err),
                );
                return Err(error);
            }
            Err(_) => {
                let error = Error::MaterialTimeout {
                    material: material.name.clone(),
                    seconds: self.timeout.as_secs(),
                };
                warn!(material = %material.name, "material check timed out");
                self.health.update(
                    health_key,
                    HealthSeverity::Warning,
                    format!(
                        "Material check for {} timed out after {}s",
                        material.name,
                        self.timeout.as_secs()
                    ),
                );
                return Err(error);
            }
        };

        self.health.clear(&health_key);

        if modifications.is_empty() {
            return Ok(MaterialUpdate::Unchanged);
        }

        let mut modifications = modifications;
        modifications.sort_by(|a, b| a.modified_at.cmp(&b.modified_at));
        Ok(MaterialUpdate::Changed(modifications))
    }
}

pub fn material_health_key(material: &Material) -> String {
    format!("material:{}", material.name)
}
