//! Materials, modifications, and material revisions.
//!
//! A material is a change source a pipeline is built from: either a
//! source-control repository or a completed stage of an upstream pipeline.
//! Materials are immutable once configured and identified by a stable
//! fingerprint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub name: String,
    pub kind: MaterialKind,
    /// How often the change source is checked, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MaterialKind {
    Scm { url: String },
    Dependency { pipeline: String, stage: String },
}

impl Material {
    pub fn scm(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MaterialKind::Scm { url: url.into() },
            poll_interval_secs: default_poll_interval(),
        }
    }

    pub fn dependency(
        name: impl Into<String>,
        pipeline: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: MaterialKind::Dependency {
                pipeline: pipeline.into(),
                stage: stage.into(),
            },
            poll_interval_secs: default_poll_interval(),
        }
    }

    /// Stable identity derived from the material's kind attributes.
    /// Two materials pointing at the same source share a fingerprint
    /// regardless of their declared names.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match &self.kind {
            MaterialKind::Scm { url } => {
                hasher.update(b"scm:");
                hasher.update(url.as_bytes());
            }
            MaterialKind::Dependency { pipeline, stage } => {
                hasher.update(b"dependency:");
                hasher.update(pipeline.as_bytes());
                hasher.update(b"/");
                hasher.update(stage.as_bytes());
            }
        }
        hex_encode(&hasher.finalize())
    }

    /// Upstream pipeline name for dependency materials.
    pub fn upstream_pipeline(&self) -> Option<&str> {
        match &self.kind {
            MaterialKind::Dependency { pipeline, .. } => Some(pipeline),
            MaterialKind::Scm { .. } => None,
        }
    }
}

/// A revision on a material. For SCM materials this is the revision id of a
/// checkin; for dependency materials it names a specific completed upstream
/// pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Revision {
    Scm(String),
    Pipeline { pipeline: String, counter: u64 },
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::Scm(rev) => write!(f, "{}", rev),
            Revision::Pipeline { pipeline, counter } => write!(f, "{}/{}", pipeline, counter),
        }
    }
}

/// One discrete change on a material. Append-only per material, ordered by
/// occurrence time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub revision: Revision,
    pub modified_at: DateTime<Utc>,
    pub author: Option<String>,
    pub comment: Option<String>,
}

impl Modification {
    pub fn scm(
        revision: impl Into<String>,
        modified_at: DateTime<Utc>,
        author: Option<String>,
    ) -> Self {
        Self {
            revision: Revision::Scm(revision.into()),
            modified_at,
            author,
            comment: None,
        }
    }

    pub fn pipeline(pipeline: impl Into<String>, counter: u64, modified_at: DateTime<Utc>) -> Self {
        Self {
            revision: Revision::Pipeline {
                pipeline: pipeline.into(),
                counter,
            },
            modified_at,
            author: None,
            comment: None,
        }
    }
}

/// "This much of the material" is included in a build cause: a material plus
/// the ordered set of modifications chosen for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRevision {
    pub material: Material,
    pub modifications: Vec<Modification>,
    /// Whether this revision set contains changes new since the pipeline's
    /// previous instance.
    #[serde(default)]
    pub changed: bool,
}

impl MaterialRevision {
    pub fn new(material: Material, modifications: Vec<Modification>, changed: bool) -> Self {
        Self {
            material,
            modifications,
            changed,
        }
    }

    /// The tip revision of the chosen modification set.
    pub fn latest(&self) -> Option<&Modification> {
        self.modifications.last()
    }

    pub fn latest_revision(&self) -> Option<&Revision> {
        self.latest().map(|m| &m.revision)
    }

    /// Upstream instance counter, for dependency materials.
    pub fn upstream_counter(&self) -> Option<u64> {
        match self.latest_revision() {
            Some(Revision::Pipeline { counter, .. }) => Some(*counter),
            _ => None,
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fingerprint_ignores_name() {
        let a = Material::scm("trunk", "svn://repo/trunk");
        let b = Material::scm("also-trunk", "svn://repo/trunk");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_kind() {
        let scm = Material::scm("x", "repo");
        let dep = Material::dependency("x", "repo", "stage");
        assert_ne!(scm.fingerprint(), dep.fingerprint());
    }

    #[test]
    fn test_latest_revision() {
        let material = Material::scm("trunk", "svn://repo/trunk");
        let now = Utc::now();
        let revision = MaterialRevision::new(
            material,
            vec![
                Modification::scm("r1", now, None),
                Modification::scm("r2", now, None),
            ],
            true,
        );
        assert_eq!(
            revision.latest_revision(),
            Some(&Revision::Scm("r2".to_string()))
        );
    }
}
