//! Scheduler configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduling loop interval in seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Bound on any single material check.
    #[serde(default = "default_material_timeout")]
    pub material_timeout_secs: u64,
    /// Minimum free space on the artifact store before scheduling stops.
    #[serde(default = "default_min_free_bytes")]
    pub min_artifact_free_bytes: u64,
    /// Minimum free space on the database volume before scheduling stops.
    #[serde(default = "default_min_free_bytes")]
    pub min_database_free_bytes: u64,
    /// Cap on jobs concurrently assigned to remote agents. Local agents are
    /// never subject to the cap.
    #[serde(default = "default_remote_agent_cap")]
    pub remote_agent_cap: usize,
}

fn default_tick_interval() -> u64 {
    10
}

fn default_material_timeout() -> u64 {
    30
}

fn default_min_free_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_remote_agent_cap() -> usize {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            material_timeout_secs: default_material_timeout(),
            min_artifact_free_bytes: default_min_free_bytes(),
            min_database_free_bytes: default_min_free_bytes(),
            remote_agent_cap: default_remote_agent_cap(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
