//! Build causes: the snapshot of material revisions that justifies creating
//! one pipeline instance.

use crate::material::MaterialRevision;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Timer,
    Modification,
    Manual,
}

/// An ordered set of material revisions (material declaration order), the
/// trigger that produced it, and the approver for manual triggers.
///
/// Two build causes with identical revision sets compare equal; once consumed
/// to create an instance a cause is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCause {
    pub material_revisions: Vec<MaterialRevision>,
    pub trigger: TriggerKind,
    pub approver: Option<String>,
}

impl BuildCause {
    pub fn modification(material_revisions: Vec<MaterialRevision>) -> Self {
        Self {
            material_revisions,
            trigger: TriggerKind::Modification,
            approver: None,
        }
    }

    pub fn timer(material_revisions: Vec<MaterialRevision>) -> Self {
        Self {
            material_revisions,
            trigger: TriggerKind::Timer,
            approver: None,
        }
    }

    pub fn manual(material_revisions: Vec<MaterialRevision>, approver: impl Into<String>) -> Self {
        Self {
            material_revisions,
            trigger: TriggerKind::Manual,
            approver: Some(approver.into()),
        }
    }

    /// Deduplication fingerprint over the ordered (material, tip revision)
    /// pairs. The trigger kind and approver deliberately do not participate.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for revision in &self.material_revisions {
            hasher.update(revision.material.fingerprint().as_bytes());
            hasher.update(b"=");
            if let Some(tip) = revision.latest_revision() {
                hasher.update(tip.to_string().as_bytes());
            }
            hasher.update(b";");
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// The revision chosen for a material, looked up by fingerprint.
    pub fn revision_for(&self, material_fingerprint: &str) -> Option<&MaterialRevision> {
        self.material_revisions
            .iter()
            .find(|r| r.material.fingerprint() == material_fingerprint)
    }

    pub fn has_changes(&self) -> bool {
        self.material_revisions.iter().any(|r| r.changed)
    }
}

impl PartialEq for BuildCause {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for BuildCause {}
