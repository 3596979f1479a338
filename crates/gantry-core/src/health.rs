//! Named health-state entries surfaced by the scheduler.
//!
//! Guard trips and resolver failures set entries here; the display layer is
//! an external consumer. Entries clear automatically once the underlying
//! condition recovers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthState {
    pub name: String,
    pub severity: HealthSeverity,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Process-wide registry of health states, keyed by name.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    states: RwLock<HashMap<String, HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, name: impl Into<String>, severity: HealthSeverity, message: impl Into<String>) {
        let name = name.into();
        let state = HealthState {
            name: name.clone(),
            severity,
            message: message.into(),
            recorded_at: Utc::now(),
        };
        self.states
            .write()
            .expect("health registry lock poisoned")
            .insert(name, state);
    }

    /// Remove an entry; returns whether one was present.
    pub fn clear(&self, name: &str) -> bool {
        self.states
            .write()
            .expect("health registry lock poisoned")
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<HealthState> {
        self.states
            .read()
            .expect("health registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<HealthState> {
        let mut states: Vec<_> = self
            .states
            .read()
            .expect("health registry lock poisoned")
            .values()
            .cloned()
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    pub fn is_empty(&self) -> bool {
        self.states
            .read()
            .expect("health registry lock poisoned")
            .is_empty()
    }
}
