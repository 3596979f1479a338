//! Strongly-typed identifiers for instances, jobs, and agents.
//!
//! Ids are uuid-v7 so creation order survives lexical sorting in logs and
//! persistence. The textual form carries a short type prefix, `job_<uuid>`,
//! which parsing accepts but does not require.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! entity_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
                let raw = value.strip_prefix(concat!($prefix, "_")).unwrap_or(value);
                raw.parse::<Uuid>().map(Self)
            }
        }
    };
}

entity_id!(InstanceId, "ins");
entity_id!(JobId, "job");
entity_id!(AgentId, "agt");
