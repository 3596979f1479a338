//! Build-cause resolution with fan-in consistency.
//!
//! Produces the next build cause for one pipeline, or decides none is needed.
//! When a pipeline reaches the same upstream material through multiple paths
//! (a diamond), every path must agree on the same upstream revision; the
//! timeline is the authority for which combinations are reachable. The chosen
//! combination is the latest one reachable from all paths.

use crate::materials::{MaterialRevisionResolver, MaterialUpdate};
use chrono::{DateTime, Utc};
use gantry_core::build_cause::{BuildCause, TriggerKind};
use gantry_core::health::{HealthRegistry, HealthSeverity};
use gantry_core::material::{Material, MaterialRevision, Modification, Revision};
use gantry_core::pipeline::PipelineConfig;
use gantry_core::timeline::PipelineTimeline;
use gantry_core::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Ordering key for one revision of a shared material. SCM revisions order by
/// occurrence time, dependency revisions by upstream counter. Keys are only
/// ever compared within one material's key space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum RevKey {
    Scm { at: DateTime<Utc>, revision: String },
    Pipeline { counter: u64 },
}

/// One selectable revision choice for a material, newest options first.
#[derive(Debug, Clone)]
struct Candidate {
    /// Material fingerprints reachable from this choice, with the revision
    /// each one is pinned to.
    keys: HashMap<String, RevKey>,
    revision: MaterialRevision,
}

pub struct BuildCauseResolver {
    materials: MaterialRevisionResolver,
    timeline: Arc<RwLock<PipelineTimeline>>,
    health: Arc<HealthRegistry>,
}

impl BuildCauseResolver {
    pub fn new(
        materials: MaterialRevisionResolver,
        timeline: Arc<RwLock<PipelineTimeline>>,
        health: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            materials,
            timeline,
            health,
        }
    }

    /// Timer-tick / modification-driven resolution. Returns `None` when no
    /// material changed or the computed cause equals the last-used one.
    pub async fn resolve_automatic(
        &self,
        config: &PipelineConfig,
        last: Option<&BuildCause>,
        trigger: TriggerKind,
    ) -> Result<Option<BuildCause>> {
        let (per_material, any_changed) = self.candidates(config, last, None).await?;
        if !any_changed {
            debug!(pipeline = %config.name, "no material changed");
            return Ok(None);
        }

        let revisions = self.pick_consistent(config, per_material)?;
        let cause = match trigger {
            TriggerKind::Timer => BuildCause::timer(revisions),
            _ => BuildCause::modification(revisions),
        };

        if let Some(last) = last
            && last.fingerprint() == cause.fingerprint()
        {
            debug!(pipeline = %config.name, "build cause unchanged, suppressing");
            return Ok(None);
        }
        Ok(Some(cause))
    }

    /// Resolution on behalf of an explicit user request. Never suppressed;
    /// the caller may pin materials to requested revisions, subject to the
    /// same consistency check.
    pub async fn resolve_manual(
        &self,
        config: &PipelineConfig,
        last: Option<&BuildCause>,
        approver: &str,
        overrides: Option<&HashMap<String, Revision>>,
    ) -> Result<BuildCause> {
        let (per_material, _) = self.candidates(config, last, overrides).await?;
        let revisions = self.pick_consistent(config, per_material)?;
        info!(pipeline = %config.name, approver, "manually resolved build cause");
        Ok(BuildCause::manual(revisions, approver))
    }

    /// Candidate revision choices per material, in declaration order.
    async fn candidates(
        &self,
        config: &PipelineConfig,
        last: Option<&BuildCause>,
        overrides: Option<&HashMap<String, Revision>>,
    ) -> Result<(Vec<Vec<Candidate>>, bool)> {
        // Resolve all materials before taking the timeline guard; the
        // resolver reads the timeline itself for dependency materials.
        let mut updates = Vec::with_capacity(config.materials.len());
        for material in &config.materials {
            let fingerprint = material.fingerprint();
            let last_revision = last.and_then(|c| c.revision_for(&fingerprint)).cloned();
            let update = self.materials.resolve(material, last_revision.as_ref()).await?;
            updates.push((material, last_revision, update));
        }

        let any_changed = updates
            .iter()
            .any(|(_, _, update)| matches!(update, MaterialUpdate::Changed(_)));

        let timeline = self.timeline.read().await;
        let mut per_material = Vec::with_capacity(updates.len());
        for (material, last_revision, update) in updates {
            let mut candidates = match material.upstream_pipeline() {
                Some(upstream) => {
                    dependency_candidates(&timeline, material, upstream, &update, last_revision)
                }
                None => scm_candidates(material, &update, last_revision),
            };

            if let Some(overrides) = overrides
                && let Some(requested) = overrides.get(&material.fingerprint())
            {
                candidates.retain(|c| c.revision.latest_revision() == Some(requested));
                if candidates.is_empty() {
                    return Err(Error::UnknownRevision {
                        material: material.name.clone(),
                        revision: requested.to_string(),
                    });
                }
            }

            per_material.push(candidates);
        }

        Ok((per_material, any_changed))
    }

    /// Apply the fan-in rule and assemble the revision set in declaration
    /// order. Maintains the per-pipeline fan-in health entry.
    fn pick_consistent(
        &self,
        config: &PipelineConfig,
        per_material: Vec<Vec<Candidate>>,
    ) -> Result<Vec<MaterialRevision>> {
        let health_key = fanin_health_key(&config.name);
        match select(&config.name, &per_material) {
            Ok(picks) => {
                self.health.clear(&health_key);
                Ok(picks
                    .into_iter()
                    .zip(per_material)
                    .map(|(i, mut candidates)| candidates.swap_remove(i).revision)
                    .collect())
            }
            Err(err) => {
                self.health.update(
                    health_key,
                    HealthSeverity::Warning,
                    format!(
                        "Pipeline {} cannot be scheduled yet: no consistent revision combination across its upstream paths",
                        config.name
                    ),
                );
                Err(err)
            }
        }
    }
}

pub fn fanin_health_key(pipeline: &str) -> String {
    format!("fanin:{}", pipeline)
}

/// Key space name for a shared upstream pipeline. Dependency materials that
/// target different stages of the same pipeline still share this key.
fn pipeline_key(name: &str) -> String {
    format!("pipeline:{}", name)
}

fn scm_candidates(
    material: &Material,
    update: &MaterialUpdate,
    last: Option<MaterialRevision>,
) -> Vec<Candidate> {
    let fingerprint = material.fingerprint();
    let mut candidates = Vec::new();

    if let MaterialUpdate::Changed(mods) = update {
        // Newest tip first; choosing tip i includes every new modification
        // up to and including it.
        for tip in (0..mods.len()).rev() {
            if let Revision::Scm(revision) = &mods[tip].revision {
                let mut keys = HashMap::new();
                keys.insert(
                    fingerprint.clone(),
                    RevKey::Scm {
                        at: mods[tip].modified_at,
                        revision: revision.clone(),
                    },
                );
                candidates.push(Candidate {
                    keys,
                    revision: MaterialRevision::new(
                        material.clone(),
                        mods[..=tip].to_vec(),
                        true,
                    ),
                });
            }
        }
    }

    if let Some(previous) = last
        && let Some(Modification {
            revision: Revision::Scm(revision),
            modified_at,
            ..
        }) = previous.latest()
    {
        let mut keys = HashMap::new();
        keys.insert(
            fingerprint,
            RevKey::Scm {
                at: *modified_at,
                revision: revision.clone(),
            },
        );
        let mut unchanged = previous.clone();
        unchanged.changed = false;
        candidates.push(Candidate {
            keys,
            revision: unchanged,
        });
    }

    candidates
}

fn dependency_candidates(
    timeline: &PipelineTimeline,
    material: &Material,
    upstream: &str,
    update: &MaterialUpdate,
    last: Option<MaterialRevision>,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    if let MaterialUpdate::Changed(mods) = update {
        for modification in mods.iter().rev() {
            if let Revision::Pipeline { counter, .. } = &modification.revision {
                candidates.push(Candidate {
                    keys: upstream_keys(timeline, upstream, *counter),
                    revision: MaterialRevision::new(
                        material.clone(),
                        vec![modification.clone()],
                        true,
                    ),
                });
            }
        }
    }

    if let Some(previous) = last
        && let Some(counter) = previous.upstream_counter()
    {
        let mut unchanged = previous.clone();
        unchanged.changed = false;
        candidates.push(Candidate {
            keys: upstream_keys(timeline, upstream, counter),
            revision: unchanged,
        });
    }

    candidates
}

/// Everything reachable from one upstream instance: the instance itself plus
/// the transitive closure of revisions recorded in the timeline. On repeated
/// fingerprints the binding closest to the chosen instance wins.
fn upstream_keys(timeline: &PipelineTimeline, upstream: &str, counter: u64) -> HashMap<String, RevKey> {
    let mut keys = HashMap::new();
    keys.insert(pipeline_key(upstream), RevKey::Pipeline { counter });
    let mut seen = HashSet::new();
    closure_keys(timeline, upstream, counter, &mut keys, &mut seen);
    keys
}

fn closure_keys(
    timeline: &PipelineTimeline,
    pipeline: &str,
    counter: u64,
    keys: &mut HashMap<String, RevKey>,
    seen: &mut HashSet<(String, u64)>,
) {
    if !seen.insert((pipeline.to_string(), counter)) {
        return;
    }
    let Some(entry) = timeline.entry(pipeline, counter) else {
        return;
    };
    for resolved in &entry.revisions {
        match &resolved.revision {
            Revision::Scm(revision) => {
                keys.entry(resolved.material_fingerprint.clone())
                    .or_insert(RevKey::Scm {
                        at: resolved.modified_at,
                        revision: revision.clone(),
                    });
            }
            Revision::Pipeline {
                pipeline: up,
                counter: c,
            } => {
                keys.entry(pipeline_key(up))
                    .or_insert(RevKey::Pipeline { counter: *c });
                closure_keys(timeline, up, *c, keys, seen);
            }
        }
    }
}

/// The fan-in rule. For every material fingerprint reachable from more than
/// one declared material, intersect the revision keys reachable along each
/// path and pin the highest common one; then pick, per material, the newest
/// candidate compatible with every pinned key.
fn select(pipeline: &str, per_material: &[Vec<Candidate>]) -> Result<Vec<usize>> {
    let mut referencing: HashMap<&str, HashSet<usize>> = HashMap::new();
    for (index, candidates) in per_material.iter().enumerate() {
        for candidate in candidates {
            for fingerprint in candidate.keys.keys() {
                referencing
                    .entry(fingerprint.as_str())
                    .or_default()
                    .insert(index);
            }
        }
    }

    let inconsistent = || Error::FanInInconsistent {
        pipeline: pipeline.to_string(),
    };

    let mut pinned: HashMap<&str, RevKey> = HashMap::new();
    for (fingerprint, paths) in &referencing {
        if paths.len() < 2 {
            continue;
        }
        let mut intersection: Option<BTreeSet<RevKey>> = None;
        for index in paths {
            let reachable: BTreeSet<RevKey> = per_material[*index]
                .iter()
                .filter_map(|c| c.keys.get(*fingerprint).cloned())
                .collect();
            if reachable.is_empty() {
                continue;
            }
            intersection = Some(match intersection {
                None => reachable,
                Some(previous) => previous.intersection(&reachable).cloned().collect(),
            });
        }
        match intersection {
            Some(common) if !common.is_empty() => {
                let latest = common.iter().next_back().cloned().ok_or_else(inconsistent)?;
                pinned.insert(fingerprint, latest);
            }
            _ => return Err(inconsistent()),
        }
    }

    let mut picks = Vec::with_capacity(per_material.len());
    for candidates in per_material {
        let pick = candidates.iter().position(|candidate| {
            candidate
                .keys
                .iter()
                .all(|(fingerprint, key)| match pinned.get(fingerprint.as_str()) {
                    Some(p) => p == key,
                    None => true,
                })
        });
        picks.push(pick.ok_or_else(inconsistent)?);
    }
    Ok(picks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gantry_core::pipeline::{JobConfig, StageConfig};
    use gantry_core::ports::ChangeSource;
    use gantry_core::timeline::ResolvedRevision;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedChangeSource {
        by_fingerprint: Mutex<HashMap<String, Vec<Modification>>>,
    }

    impl ScriptedChangeSource {
        fn new() -> Self {
            Self {
                by_fingerprint: Mutex::new(HashMap::new()),
            }
        }

        fn add(&self, material: &Material, modification: Modification) {
            self.by_fingerprint
                .lock()
                .unwrap()
                .entry(material.fingerprint())
                .or_default()
                .push(modification);
        }
    }

    #[async_trait]
    impl ChangeSource for ScriptedChangeSource {
        async fn poll_changes(
            &self,
            material: &Material,
            since: Option<&Revision>,
        ) -> Result<Vec<Modification>> {
            let all = self
                .by_fingerprint
                .lock()
                .unwrap()
                .get(&material.fingerprint())
                .cloned()
                .unwrap_or_default();
            let start = match since {
                Some(revision) => all
                    .iter()
                    .position(|m| &m.revision == revision)
                    .map(|i| i + 1)
                    .unwrap_or(0),
                None => 0,
            };
            Ok(all[start..].to_vec())
        }
    }

    struct Fixture {
        resolver: BuildCauseResolver,
        source: Arc<ScriptedChangeSource>,
        timeline: Arc<RwLock<PipelineTimeline>>,
        health: Arc<HealthRegistry>,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(ScriptedChangeSource::new());
        let timeline = Arc::new(RwLock::new(PipelineTimeline::new()));
        let health = Arc::new(HealthRegistry::new());
        let materials = MaterialRevisionResolver::new(
            source.clone(),
            timeline.clone(),
            health.clone(),
            Duration::from_secs(5),
        );
        let resolver = BuildCauseResolver::new(materials, timeline.clone(), health.clone());
        Fixture {
            resolver,
            source,
            timeline,
            health,
        }
    }

    fn pipeline_config(name: &str, materials: Vec<Material>) -> PipelineConfig {
        PipelineConfig {
            name: name.to_string(),
            group: "defaultGroup".to_string(),
            materials,
            stages: vec![StageConfig {
                name: "build".to_string(),
                jobs: vec![JobConfig {
                    name: "compile".to_string(),
                    resources: vec![],
                }],
            }],
            environment: None,
        }
    }

    fn scm_resolved(material: &Material, revision: &str, at: DateTime<Utc>) -> ResolvedRevision {
        ResolvedRevision {
            material_fingerprint: material.fingerprint(),
            revision: Revision::Scm(revision.to_string()),
            modified_at: at,
        }
    }

    fn dep_resolved(material: &Material, upstream: &str, counter: u64) -> ResolvedRevision {
        ResolvedRevision {
            material_fingerprint: material.fingerprint(),
            revision: Revision::Pipeline {
                pipeline: upstream.to_string(),
                counter,
            },
            modified_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_no_changes_yields_no_cause() {
        let fixture = fixture();
        let svn = Material::scm("trunk", "svn://repo/trunk");
        let config = pipeline_config("deploy", vec![svn]);

        let cause = fixture
            .resolver
            .resolve_automatic(&config, None, TriggerKind::Modification)
            .await
            .unwrap();
        assert!(cause.is_none());
    }

    #[tokio::test]
    async fn test_new_modification_produces_cause_in_declaration_order() {
        let fixture = fixture();
        let svn = Material::scm("trunk", "svn://repo/trunk");
        let git = Material::scm("tools", "git://repo/tools");
        let now = Utc::now();
        fixture.source.add(&svn, Modification::scm("s1", now, None));
        fixture.source.add(&git, Modification::scm("g1", now, None));

        let config = pipeline_config("deploy", vec![svn.clone(), git.clone()]);
        let cause = fixture
            .resolver
            .resolve_automatic(&config, None, TriggerKind::Modification)
            .await
            .unwrap()
            .expect("expected a build cause");

        assert_eq!(cause.trigger, TriggerKind::Modification);
        let fingerprints: Vec<String> = cause
            .material_revisions
            .iter()
            .map(|r| r.material.fingerprint())
            .collect();
        assert_eq!(fingerprints, vec![svn.fingerprint(), git.fingerprint()]);
    }

    #[tokio::test]
    async fn test_identical_cause_is_suppressed() {
        let fixture = fixture();
        let svn = Material::scm("trunk", "svn://repo/trunk");
        let now = Utc::now();
        fixture.source.add(&svn, Modification::scm("s1", now, None));
        let config = pipeline_config("deploy", vec![svn]);

        let first = fixture
            .resolver
            .resolve_automatic(&config, None, TriggerKind::Modification)
            .await
            .unwrap()
            .unwrap();

        let second = fixture
            .resolver
            .resolve_automatic(&config, Some(&first), TriggerKind::Modification)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    /// Diamond: `middle-a` and `middle-b` both build from pipeline `base`.
    /// `middle-a` has an instance against base@2, but `middle-b` has only
    /// built against base@1, so base@1 is the latest consistent choice.
    #[tokio::test]
    async fn test_diamond_pins_latest_shared_upstream() {
        let fixture = fixture();
        let base_dep_a = Material::dependency("base", "base", "dist");
        let base_dep_b = Material::dependency("base", "base", "dist");
        {
            let mut timeline = fixture.timeline.write().await;
            timeline
                .append("base".to_string(), 1, vec![], Utc::now())
                .unwrap();
            timeline
                .append("base".to_string(), 2, vec![], Utc::now())
                .unwrap();
            timeline
                .append(
                    "middle-a".to_string(),
                    1,
                    vec![dep_resolved(&base_dep_a, "base", 1)],
                    Utc::now(),
                )
                .unwrap();
            timeline
                .append(
                    "middle-a".to_string(),
                    2,
                    vec![dep_resolved(&base_dep_a, "base", 2)],
                    Utc::now(),
                )
                .unwrap();
            timeline
                .append(
                    "middle-b".to_string(),
                    1,
                    vec![dep_resolved(&base_dep_b, "base", 1)],
                    Utc::now(),
                )
                .unwrap();
        }

        let config = pipeline_config(
            "leaf",
            vec![
                Material::dependency("middle-a", "middle-a", "dist"),
                Material::dependency("middle-b", "middle-b", "dist"),
            ],
        );

        let cause = fixture
            .resolver
            .resolve_automatic(&config, None, TriggerKind::Modification)
            .await
            .unwrap()
            .expect("expected a build cause");

        let counters: Vec<Option<u64>> = cause
            .material_revisions
            .iter()
            .map(|r| r.upstream_counter())
            .collect();
        // middle-a@2 is newer but only middle-a@1 shares base@1 with middle-b.
        assert_eq!(counters, vec![Some(1), Some(1)]);
    }

    #[tokio::test]
    async fn test_empty_intersection_reports_not_yet_consistent() {
        let fixture = fixture();
        let base_dep = Material::dependency("base", "base", "dist");
        {
            let mut timeline = fixture.timeline.write().await;
            timeline
                .append("base".to_string(), 1, vec![], Utc::now())
                .unwrap();
            timeline
                .append("base".to_string(), 2, vec![], Utc::now())
                .unwrap();
            timeline
                .append(
                    "middle-a".to_string(),
                    1,
                    vec![dep_resolved(&base_dep, "base", 1)],
                    Utc::now(),
                )
                .unwrap();
            timeline
                .append(
                    "middle-b".to_string(),
                    1,
                    vec![dep_resolved(&base_dep, "base", 2)],
                    Utc::now(),
                )
                .unwrap();
        }

        let config = pipeline_config(
            "leaf",
            vec![
                Material::dependency("middle-a", "middle-a", "dist"),
                Material::dependency("middle-b", "middle-b", "dist"),
            ],
        );

        let err = fixture
            .resolver
            .resolve_automatic(&config, None, TriggerKind::Modification)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FanInInconsistent { .. }));
        assert!(fixture.health.get(&fanin_health_key("leaf")).is_some());
    }

    /// `svn -> up_pipe -> down_pipe` plus a direct
    /// `svn -> down_pipe` edge. After the direct material is removed from
    /// the configuration, recomputing yields a cause referencing up_pipe@1
    /// only.
    #[tokio::test]
    async fn test_material_removal_recompute_keeps_upstream_only() {
        let fixture = fixture();
        let svn = Material::scm("svn", "svn://repo/trunk");
        let up_dep = Material::dependency("up_pipe", "up_pipe", "dist");
        let now = Utc::now();
        fixture.source.add(&svn, Modification::scm("s1", now, None));
        {
            let mut timeline = fixture.timeline.write().await;
            timeline
                .append(
                    "up_pipe".to_string(),
                    1,
                    vec![scm_resolved(&svn, "s1", now)],
                    Utc::now(),
                )
                .unwrap();
        }

        // down_pipe builds once with both materials.
        let original = pipeline_config("down_pipe", vec![svn.clone(), up_dep.clone()]);
        let first = fixture
            .resolver
            .resolve_automatic(&original, None, TriggerKind::Modification)
            .await
            .unwrap()
            .expect("expected a build cause");
        assert_eq!(first.material_revisions.len(), 2);

        // Direct svn material removed from the configuration; recompute.
        let trimmed = pipeline_config("down_pipe", vec![up_dep.clone()]);
        let recomputed = fixture
            .resolver
            .resolve_manual(&trimmed, Some(&first), "admin", None)
            .await
            .unwrap();

        assert_eq!(recomputed.material_revisions.len(), 1);
        assert_eq!(
            recomputed.material_revisions[0].latest_revision(),
            Some(&Revision::Pipeline {
                pipeline: "up_pipe".to_string(),
                counter: 1,
            })
        );
    }

    #[tokio::test]
    async fn test_manual_override_pins_requested_revision() {
        let fixture = fixture();
        let svn = Material::scm("trunk", "svn://repo/trunk");
        let now = Utc::now();
        fixture.source.add(&svn, Modification::scm("s1", now, None));
        fixture.source.add(
            &svn,
            Modification::scm("s2", now + chrono::Duration::seconds(1), None),
        );
        let config = pipeline_config("deploy", vec![svn.clone()]);

        let mut overrides = HashMap::new();
        overrides.insert(svn.fingerprint(), Revision::Scm("s1".to_string()));

        let cause = fixture
            .resolver
            .resolve_manual(&config, None, "admin", Some(&overrides))
            .await
            .unwrap();
        assert_eq!(cause.trigger, TriggerKind::Manual);
        assert_eq!(cause.approver.as_deref(), Some("admin"));
        assert_eq!(
            cause.material_revisions[0].latest_revision(),
            Some(&Revision::Scm("s1".to_string()))
        );

        let mut unknown = HashMap::new();
        unknown.insert(svn.fingerprint(), Revision::Scm("missing".to_string()));
        let err = fixture
            .resolver
            .resolve_manual(&config, None, "admin", Some(&unknown))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRevision { .. }));
    }
}
