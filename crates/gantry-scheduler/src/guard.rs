//! Admission checks for scheduling.
//!
//! Two concerns gate the scheduler: disk headroom on the artifact and
//! database volumes, and operate permission for manually requested
//! operations. Storage checks fail closed: a probe error blocks scheduling
//! the same way a full disk does.

use gantry_core::events::{Event, HealthChangedPayload};
use gantry_core::health::{HealthRegistry, HealthSeverity};
use gantry_core::operation::OperationStatus;
use gantry_core::ports::{EventBus, PermissionChecker, PipelineConfigSource, StorageMonitor};
use gantry_core::Result;
use std::sync::Arc;
use tracing::{error, warn};

pub const ARTIFACT_DISK_HEALTH: &str = "scheduler:artifact-disk-space";
pub const DATABASE_DISK_HEALTH: &str = "scheduler:database-disk-space";

pub struct SchedulingGuard {
    storage: Arc<dyn StorageMonitor>,
    permissions: Arc<dyn PermissionChecker>,
    configs: Arc<dyn PipelineConfigSource>,
    health: Arc<HealthRegistry>,
    bus: Arc<dyn EventBus>,
    min_artifact_free_bytes: u64,
    min_database_free_bytes: u64,
}

impl SchedulingGuard {
    pub fn new(
        storage: Arc<dyn StorageMonitor>,
        permissions: Arc<dyn PermissionChecker>,
        configs: Arc<dyn PipelineConfigSource>,
        health: Arc<HealthRegistry>,
        bus: Arc<dyn EventBus>,
        min_artifact_free_bytes: u64,
        min_database_free_bytes: u64,
    ) -> Self {
        Self {
            storage,
            permissions,
            configs,
            health,
            bus,
            min_artifact_free_bytes,
            min_database_free_bytes,
        }
    }

    /// Whether automatic scheduling may create stages and instances now.
    pub async fn can_schedule_stage(&self) -> bool {
        self.storage_ok().await
    }

    /// Manual triggers pass through the same storage gate.
    pub async fn can_trigger_manual_pipeline(&self) -> bool {
        self.storage_ok().await
    }

    async fn storage_ok(&self) -> bool {
        let artifact = self
            .check_volume(
                "artifact",
                ARTIFACT_DISK_HEALTH,
                self.min_artifact_free_bytes,
                self.storage.artifact_free_bytes().await,
            )
            .await;
        let database = self
            .check_volume(
                "database",
                DATABASE_DISK_HEALTH,
                self.min_database_free_bytes,
                self.storage.database_free_bytes().await,
            )
            .await;
        artifact && database
    }

    async fn check_volume(
        &self,
        location: &str,
        health_key: &str,
        required_bytes: u64,
        probe: Result<u64>,
    ) -> bool {
        match probe {
            Ok(free_bytes) if free_bytes >= required_bytes => {
                self.clear_health(health_key).await;
                true
            }
            Ok(free_bytes) => {
                error!(location, free_bytes, required_bytes, "disk space below threshold");
                self.trip_health(
                    health_key,
                    format!(
                        "Scheduling paused: {} volume has {} bytes free, {} required",
                        location, free_bytes, required_bytes
                    ),
                )
                .await;
                false
            }
            Err(err) => {
                error!(location, %err, "disk space probe failed");
                self.trip_health(
                    health_key,
                    format!("Scheduling paused: {} volume check failed: {}", location, err),
                )
                .await;
                false
            }
        }
    }

    /// Permission and existence check for a manual operation on
    /// `pipeline` (and optionally one of its stages).
    pub async fn check_operate(
        &self,
        user: &str,
        pipeline: &str,
        stage: Option<&str>,
    ) -> Result<OperationStatus> {
        let Some(config) = self.configs.pipeline(pipeline).await? else {
            return Ok(OperationStatus::NotFound);
        };
        if let Some(stage) = stage
            && config.stage(stage).is_none()
        {
            return Ok(OperationStatus::NotFound);
        }
        if !self.permissions.can_operate(user, &config.group).await? {
            warn!(user, pipeline, group = %config.group, "operate permission denied");
            return Ok(OperationStatus::Forbidden);
        }
        Ok(OperationStatus::Ok)
    }

    async fn trip_health(&self, name: &str, message: String) {
        let already_tripped = self
            .health
            .get(name)
            .is_some_and(|s| s.severity == HealthSeverity::Error);
        self.health.update(name, HealthSeverity::Error, message.clone());
        if !already_tripped {
            self.publish_health(name, Some(HealthSeverity::Error), Some(message))
                .await;
        }
    }

    async fn clear_health(&self, name: &str) {
        if self.health.clear(name) {
            self.publish_health(name, None, None).await;
        }
    }

    async fn publish_health(
        &self,
        name: &str,
        severity: Option<HealthSeverity>,
        message: Option<String>,
    ) {
        let event = Event::HealthChanged(HealthChangedPayload {
            name: name.to_string(),
            severity,
            message,
        });
        if let Err(err) = self.bus.publish(event).await {
            warn!(%err, "failed to publish health event");
        }
    }
}
