//! Read-only view of the external configuration document.
//!
//! The configuration document itself (parsing, validation, versioning) lives
//! outside this engine; these types are the minimal projection the scheduler
//! needs: group membership, material declaration order, the declared stage
//! sequence, and per-job constraints.

use crate::material::Material;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub group: String,
    /// Materials in declaration order; this order is preserved in build causes.
    pub materials: Vec<Material>,
    /// Declared stage sequence; stage order ids follow this, not elapsed time.
    pub stages: Vec<StageConfig>,
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Resource tags the executing agent must carry.
    #[serde(default)]
    pub resources: Vec<String>,
}

impl PipelineConfig {
    pub fn first_stage(&self) -> Option<&StageConfig> {
        self.stages.first()
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The declared stage following `name`, if any.
    pub fn stage_after(&self, name: &str) -> Option<&StageConfig> {
        let index = self.stages.iter().position(|s| s.name == name)?;
        self.stages.get(index + 1)
    }
}
