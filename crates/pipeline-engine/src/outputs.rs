//! Sweeping outputs - named values published into an execution scope
//!
//! A value is stored against one level of the ambiance (or the plan itself)
//! and is visible to every node beneath that level.

use std::collections::HashMap;

use parking_lot::RwLock;
use pipeline_contracts::Ambiance;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Flag set by the on-fail pipeline rollback adviser.
pub const USE_PIPELINE_ROLLBACK_STRATEGY: &str = "usePipelineRollbackStrategy";

const PLAN_SCOPE: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputScope {
    Pipeline,
    Stage,
    StepGroup,
    Current,
}

#[derive(Default)]
pub struct SweepingOutputStore {
    /// (plan execution id, scope runtime id, name) -> value
    outputs: RwLock<HashMap<(String, String, String), Value>>,
}

impl SweepingOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope_key(ambiance: &Ambiance, scope: OutputScope) -> Result<String> {
        let level = match scope {
            OutputScope::Pipeline => return Ok(PLAN_SCOPE.to_string()),
            OutputScope::Stage => ambiance.stage_level(),
            OutputScope::StepGroup => ambiance.step_group_level(),
            OutputScope::Current => ambiance.current_level(),
        };
        level.map(|l| l.runtime_id.clone()).ok_or_else(|| {
            EngineError::invalid(format!(
                "no {:?} level in ambiance '{}'",
                scope,
                ambiance.fqn()
            ))
        })
    }

    /// Publish `value` under `name` at `scope`, overwriting any previous value.
    pub fn consume(
        &self,
        ambiance: &Ambiance,
        name: &str,
        value: Value,
        scope: OutputScope,
    ) -> Result<()> {
        let key = Self::scope_key(ambiance, scope)?;
        log::debug!(
            "Sweeping output '{}' set at {:?} scope of plan execution {}",
            name,
            scope,
            ambiance.plan_execution_id
        );
        self.outputs.write().insert(
            (ambiance.plan_execution_id.clone(), key, name.to_string()),
            value,
        );
        Ok(())
    }

    /// Innermost visible value for `name`, searching outward to the plan scope.
    pub fn resolve(&self, ambiance: &Ambiance, name: &str) -> Option<Value> {
        let outputs = self.outputs.read();
        let lookup = |scope: &str| {
            outputs
                .get(&(
                    ambiance.plan_execution_id.clone(),
                    scope.to_string(),
                    name.to_string(),
                ))
                .cloned()
        };
        ambiance
            .levels()
            .iter()
            .rev()
            .find_map(|l| lookup(&l.runtime_id))
            .or_else(|| lookup(PLAN_SCOPE))
    }

    pub fn resolve_flag(&self, ambiance: &Ambiance, name: &str) -> bool {
        self.resolve(ambiance, name)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Remove every output of a finished plan execution.
    pub fn clear(&self, plan_execution_id: &str) {
        self.outputs
            .write()
            .retain(|(plan, _, _), _| plan != plan_execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_contracts::{groups, Level, StepType};
    use serde_json::json;

    fn ambiance() -> Ambiance {
        Ambiance::new("pe-1", "plan")
            .clone_for_child(
                Level::new("rt-stage", "stage", "deploy", StepType::step("SECTION"))
                    .with_group(groups::STAGE),
            )
            .clone_for_child(
                Level::new("rt-step", "step", "shell", StepType::step("SHELL"))
                    .with_group(groups::STEP),
            )
    }

    #[test]
    fn test_pipeline_scope_visible_from_anywhere() {
        let store = SweepingOutputStore::new();
        let amb = ambiance();
        store
            .consume(&amb, USE_PIPELINE_ROLLBACK_STRATEGY, json!(true), OutputScope::Pipeline)
            .unwrap();

        assert!(store.resolve_flag(&Ambiance::new("pe-1", "plan"), USE_PIPELINE_ROLLBACK_STRATEGY));
        assert!(!store.resolve_flag(&Ambiance::new("pe-2", "plan"), USE_PIPELINE_ROLLBACK_STRATEGY));
    }

    #[test]
    fn test_innermost_value_wins() {
        let store = SweepingOutputStore::new();
        let amb = ambiance();
        store.consume(&amb, "image", json!("v1"), OutputScope::Stage).unwrap();
        store.consume(&amb, "image", json!("v2"), OutputScope::Current).unwrap();

        assert_eq!(store.resolve(&amb, "image"), Some(json!("v2")));
        assert_eq!(store.resolve(&amb.clone_for_finish(), "image"), Some(json!("v1")));
    }

    #[test]
    fn test_missing_scope_level_is_invalid() {
        let store = SweepingOutputStore::new();
        let err = store
            .consume(&ambiance(), "x", json!(1), OutputScope::StepGroup)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArguments(_)));
    }

    #[test]
    fn test_clear_plan() {
        let store = SweepingOutputStore::new();
        let amb = ambiance();
        store.consume(&amb, "x", json!(1), OutputScope::Pipeline).unwrap();
        store.clear("pe-1");
        assert!(store.resolve(&amb, "x").is_none());
    }
}
