//! Ambiance - where execution currently is
//!
//! An [`Ambiance`] is the ordered path of [`Level`]s from the plan root to
//! the node that is executing right now. It is never mutated in place:
//! descending into a child produces a copy with one more level, finishing a
//! node produces a copy with one fewer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ContractError, Result};
use crate::step::{groups, StepType};

pub const ACCOUNT_ID: &str = "accountId";
pub const ORG_IDENTIFIER: &str = "orgIdentifier";
pub const PROJECT_IDENTIFIER: &str = "projectIdentifier";

/// One step of the execution path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    /// Node execution id at this depth
    pub runtime_id: String,
    /// Plan node id at this depth
    pub setup_id: String,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub step_type: StepType,
    #[serde(default)]
    pub retry_index: u32,
    /// Epoch millis at which this level started
    pub start_ts: i64,
}

impl Level {
    pub fn new(
        runtime_id: impl Into<String>,
        setup_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
    ) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            setup_id: setup_id.into(),
            identifier: identifier.into(),
            group: None,
            step_type,
            retry_index: 0,
            start_ts: 0,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_retry_index(mut self, retry_index: u32) -> Self {
        self.retry_index = retry_index;
        self
    }

    pub fn with_start_ts(mut self, start_ts: i64) -> Self {
        self.start_ts = start_ts;
        self
    }

    pub fn group_is(&self, group: &str) -> bool {
        self.group.as_deref() == Some(group)
    }
}

/// Immutable root-to-current execution path.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ambiance {
    pub plan_execution_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    #[serde(default)]
    levels: Vec<Level>,
}

impl Ambiance {
    pub fn new(plan_execution_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            setup_abstractions: BTreeMap::new(),
            levels: Vec::new(),
        }
    }

    pub fn with_setup_abstraction(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setup_abstractions.insert(key.into(), value.into());
        self
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Copy of this ambiance with `level` appended.
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut child = self.clone();
        child.levels.push(level);
        child
    }

    /// Copy of this ambiance without the current level.
    pub fn clone_for_finish(&self) -> Self {
        let mut parent = self.clone();
        parent.levels.pop();
        parent
    }

    /// Copy keeping only the first `depth` levels.
    pub fn clone_to_depth(&self, depth: usize) -> Self {
        let mut copy = self.clone();
        copy.levels.truncate(depth);
        copy
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    fn require_current(&self) -> Result<&Level> {
        self.current_level().ok_or(ContractError::EmptyAmbiance)
    }

    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    pub fn step_identifier(&self) -> Option<&str> {
        self.current_level().map(|l| l.identifier.as_str())
    }

    pub fn current_group(&self) -> Option<&str> {
        self.current_level().and_then(|l| l.group.as_deref())
    }

    pub fn current_step_type(&self) -> Option<&StepType> {
        self.current_level().map(|l| &l.step_type)
    }

    pub fn current_level_start_ts(&self) -> Result<i64> {
        Ok(self.require_current()?.start_ts)
    }

    pub fn parent_level(&self) -> Option<&Level> {
        let len = self.levels.len();
        if len < 2 {
            return None;
        }
        self.levels.get(len - 2)
    }

    pub fn parent_runtime_id(&self) -> Option<&str> {
        self.parent_level().map(|l| l.runtime_id.as_str())
    }

    /// Innermost level whose group matches.
    pub fn level_for_group(&self, group: &str) -> Option<&Level> {
        self.levels.iter().rev().find(|l| l.group_is(group))
    }

    pub fn stage_level(&self) -> Option<&Level> {
        self.level_for_group(groups::STAGE)
    }

    pub fn step_group_level(&self) -> Option<&Level> {
        self.level_for_group(groups::STEP_GROUP)
    }

    pub fn is_retry(&self) -> bool {
        self.current_level().is_some_and(|l| l.retry_index > 0)
    }

    /// Dotted identifiers from the root, e.g. `pipeline.stages.deploy.steps.shell`.
    pub fn fqn(&self) -> String {
        self.levels
            .iter()
            .map(|l| l.identifier.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstractions.get(ACCOUNT_ID).map(String::as_str)
    }

    pub fn org_identifier(&self) -> Option<&str> {
        self.setup_abstractions.get(ORG_IDENTIFIER).map(String::as_str)
    }

    pub fn project_identifier(&self) -> Option<&str> {
        self.setup_abstractions
            .get(PROJECT_IDENTIFIER)
            .map(String::as_str)
    }
}
