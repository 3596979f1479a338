//! Stage ordering.
//!
//! Order ids follow the declared stage sequence, not elapsed time. A follow-on
//! stage always receives an order strictly greater than every order ever used
//! in the instance; a rerun keeps the original order id and never appends a
//! new value. The exact gap between consecutive orders is not a contract,
//! only "strictly increasing, rerun-preserving" is.

use gantry_core::instance::{PipelineInstance, Stage};
use gantry_core::pipeline::{PipelineConfig, StageConfig};
use gantry_core::{Error, Result};
use tracing::debug;

#[derive(Debug, Default)]
pub struct StageOrderingEngine;

impl StageOrderingEngine {
    pub fn new() -> Self {
        Self
    }

    /// The first stage of a fresh instance, order 1.
    pub fn first_stage(&self, config: &PipelineConfig) -> Result<Stage> {
        let stage_config = config
            .first_stage()
            .ok_or_else(|| Error::Internal(format!("pipeline {} has no stages", config.name)))?;
        Ok(Stage::from_config(stage_config, 1))
    }

    /// The declared stage following `completed`, with the next order id,
    /// or `None` when `completed` is the last declared stage.
    pub fn follow_on(
        &self,
        instance: &PipelineInstance,
        config: &PipelineConfig,
        completed: &str,
    ) -> Option<Stage> {
        let next = config.stage_after(completed)?;
        let order_id = instance.max_order() + 1;
        debug!(
            pipeline = %instance.name,
            counter = instance.counter,
            stage = %next.name,
            order_id,
            "scheduling follow-on stage"
        );
        Some(Stage::from_config(next, order_id))
    }

    /// A manual rerun of an already-ordered stage. Reuses the existing order
    /// id unchanged.
    pub fn rerun(
        &self,
        instance: &PipelineInstance,
        stage_config: &StageConfig,
        approver: &str,
    ) -> Result<Stage> {
        let existing = instance
            .stage(&stage_config.name)
            .ok_or_else(|| Error::StageNotFound {
                pipeline: instance.name.clone(),
                stage: stage_config.name.clone(),
            })?;
        if existing.is_active() {
            return Err(Error::AlreadyInProgress {
                pipeline: instance.name.clone(),
                stage: stage_config.name.clone(),
            });
        }

        let mut rerun = Stage::from_config(stage_config, existing.order_id);
        rerun.rerun = true;
        rerun.approved_by = Some(approver.to_string());
        debug!(
            pipeline = %instance.name,
            counter = instance.counter,
            stage = %stage_config.name,
            order_id = rerun.order_id,
            "rerunning stage"
        );
        Ok(rerun)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::build_cause::BuildCause;
    use gantry_core::instance::{StageResult, StageState};
    use gantry_core::pipeline::JobConfig;

    fn config() -> PipelineConfig {
        PipelineConfig {
            name: "deploy".to_string(),
            group: "g1".to_string(),
            materials: vec![],
            stages: vec![
                StageConfig {
                    name: "build".to_string(),
                    jobs: vec![JobConfig {
                        name: "compile".to_string(),
                        resources: vec![],
                    }],
                },
                StageConfig {
                    name: "test".to_string(),
                    jobs: vec![JobConfig {
                        name: "unit".to_string(),
                        resources: vec![],
                    }],
                },
            ],
            environment: None,
        }
    }

    fn instance_with_order(order_id: u64) -> (PipelineInstance, PipelineConfig) {
        let config = config();
        let mut first = Stage::from_config(&config.stages[0], order_id);
        first.complete(StageResult::Passed);
        let instance = PipelineInstance::new(&config, 1, BuildCause::modification(vec![]), first);
        (instance, config)
    }

    #[test]
    fn test_first_stage_has_order_one() {
        let engine = StageOrderingEngine::new();
        let stage = engine.first_stage(&config()).unwrap();
        assert_eq!(stage.name, "build");
        assert_eq!(stage.order_id, 1);
    }

    #[test]
    fn test_rerun_preserves_order_id() {
        let engine = StageOrderingEngine::new();
        let (instance, config) = instance_with_order(1000);

        let rerun = engine
            .rerun(&instance, config.stage("build").unwrap(), "admin")
            .unwrap();
        assert_eq!(rerun.order_id, 1000);
        assert!(rerun.rerun);
        assert_eq!(rerun.state, StageState::Scheduled);
    }

    #[test]
    fn test_follow_on_is_strictly_greater_than_any_existing_order() {
        let engine = StageOrderingEngine::new();
        let (instance, config) = instance_with_order(1000);

        let next = engine.follow_on(&instance, &config, "build").unwrap();
        assert_eq!(next.name, "test");
        assert_eq!(next.order_id, 1001);
    }

    #[test]
    fn test_follow_on_after_last_stage_is_none() {
        let engine = StageOrderingEngine::new();
        let (mut instance, config) = instance_with_order(1);
        instance
            .stages
            .push(Stage::from_config(&config.stages[1], 2));

        assert!(engine.follow_on(&instance, &config, "test").is_none());
    }

    #[test]
    fn test_rerun_of_building_stage_is_conflict() {
        let engine = StageOrderingEngine::new();
        let config = config();
        let mut first = Stage::from_config(&config.stages[0], 1);
        first.state = StageState::Building;
        let instance = PipelineInstance::new(&config, 1, BuildCause::modification(vec![]), first);

        let err = engine
            .rerun(&instance, config.stage("build").unwrap(), "admin")
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyInProgress { .. }));
    }

    #[test]
    fn test_cancel_does_not_disturb_sibling_orders() {
        let engine = StageOrderingEngine::new();
        let (mut instance, config) = instance_with_order(1);
        let mut second = Stage::from_config(&config.stages[1], 2);
        second.complete(StageResult::Cancelled);
        instance.stages.push(second);

        // A rerun of the first stage still reuses order 1.
        let rerun = engine
            .rerun(&instance, config.stage("build").unwrap(), "admin")
            .unwrap();
        assert_eq!(rerun.order_id, 1);
        assert_eq!(instance.stage("test").unwrap().order_id, 2);
    }
}
