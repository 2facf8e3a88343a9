//! Step type and facilitator vocabulary

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ContractError;

/// Well-known values of a plan node's `group` field.
pub mod groups {
    pub const PIPELINE: &str = "PIPELINE";
    pub const STAGES: &str = "STAGES";
    pub const STAGE: &str = "STAGE";
    pub const STEP_GROUP: &str = "STEP_GROUP";
    pub const STEPS: &str = "STEPS";
    pub const STEP: &str = "STEP";
}

/// Type names of the built-in steps.
pub mod step_types {
    pub const BARRIER: &str = "BARRIER";
    pub const FORK: &str = "FORK";
    pub const SECTION: &str = "SECTION";
    pub const PIPELINE_STAGE: &str = "PIPELINE_STAGE";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCategory {
    Pipeline,
    Stage,
    StepGroup,
    Step,
    Fork,
    Strategy,
}

/// Identifies a step implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepType {
    pub type_name: String,
    pub category: StepCategory,
}

impl StepType {
    pub fn new(type_name: impl Into<String>, category: StepCategory) -> Self {
        Self {
            type_name: type_name.into(),
            category,
        }
    }

    pub fn step(type_name: impl Into<String>) -> Self {
        Self::new(type_name, StepCategory::Step)
    }

    pub fn is(&self, type_name: &str) -> bool {
        self.type_name == type_name
    }
}

/// Execution contract a plan node declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FacilitatorType {
    Sync,
    Async,
    Child,
    Children,
    Task,
}

impl FacilitatorType {
    pub fn as_str(self) -> &'static str {
        match self {
            FacilitatorType::Sync => "SYNC",
            FacilitatorType::Async => "ASYNC",
            FacilitatorType::Child => "CHILD",
            FacilitatorType::Children => "CHILDREN",
            FacilitatorType::Task => "TASK",
        }
    }
}

impl fmt::Display for FacilitatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FacilitatorType {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYNC" => Ok(FacilitatorType::Sync),
            "ASYNC" => Ok(FacilitatorType::Async),
            "CHILD" => Ok(FacilitatorType::Child),
            "CHILDREN" => Ok(FacilitatorType::Children),
            "TASK" => Ok(FacilitatorType::Task),
            other => Err(ContractError::unknown("facilitator type", other)),
        }
    }
}
