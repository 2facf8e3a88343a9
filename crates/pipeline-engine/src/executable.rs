//! Step execution contracts
//!
//! Every step implements exactly one contract. The contracts form the
//! closed set [`Executable`]; the facilitator dispatches over it with an
//! exhaustive `match`, so adding a contract is a compile error everywhere
//! a dispatch site forgets it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use pipeline_contracts::{Ambiance, FacilitatorType, FailureInfo, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::waiter::{NotifyResponse, ResponseMap};

/// Outcome key under which rollback information travels between sections.
pub const ROLLBACK_OUTCOME: &str = "rollbackOutcome";

/// What a step sees when it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub node_execution_id: String,
    pub ambiance: Ambiance,
    pub parameters: Value,
}

impl StepContext {
    /// Typed view of the step parameters.
    pub fn parameters_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.parameters.clone())?)
    }

    pub fn identifier(&self) -> &str {
        self.ambiance.step_identifier().unwrap_or_default()
    }
}

/// Terminal result of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcomes: BTreeMap<String, Value>,
}

impl StepResponse {
    pub fn succeeded() -> Self {
        Self {
            status: Status::Succeeded,
            failure_info: None,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            failure_info: Some(failure_info),
            outcomes: BTreeMap::new(),
        }
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            ..Self::succeeded()
        }
    }

    pub fn with_outcome(mut self, name: impl Into<String>, value: Value) -> Self {
        self.outcomes.insert(name.into(), value);
        self
    }
}

/// Rollback information a section hands to its parent. Always copied,
/// never shared, so each consumer may edit its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    /// Stage or step group the rollback belongs to
    pub identifier: String,
    pub rollback_info: Value,
}

impl RollbackOutcome {
    pub fn from_outcomes(outcomes: &BTreeMap<String, Value>) -> Option<Self> {
        outcomes
            .get(ROLLBACK_OUTCOME)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Copy tagged with a new owning identifier.
    pub fn retagged(&self, identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            rollback_info: self.rollback_info.clone(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A chained pipeline an async step asks the engine to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildPlanRequest {
    pub plan_id: String,
    pub plan_execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AsyncExecutableResponse {
    pub callback_ids: Vec<String>,
    pub child_plans: Vec<ChildPlanRequest>,
}

impl AsyncExecutableResponse {
    pub fn waiting_on(callback_id: impl Into<String>) -> Self {
        Self {
            callback_ids: vec![callback_id.into()],
            child_plans: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildRequest {
    pub child_node_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildrenRequest {
    pub child_node_ids: Vec<String>,
}

/// Work handed to an external delegate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// Record of how a node was dispatched, kept on the node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutableResponse {
    #[serde(rename_all = "camelCase")]
    Sync { status: Status },
    #[serde(rename_all = "camelCase")]
    Async { callback_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Child { child_runtime_id: String },
    #[serde(rename_all = "camelCase")]
    Children { child_runtime_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Task { task_id: String },
}

#[async_trait]
pub trait SyncExecutable: Send + Sync {
    async fn execute_sync(&self, ctx: &StepContext) -> Result<StepResponse>;
}

#[async_trait]
pub trait AsyncExecutable: Send + Sync {
    async fn execute_async(&self, ctx: &StepContext) -> Result<AsyncExecutableResponse>;

    async fn handle_async_response(
        &self,
        ctx: &StepContext,
        responses: &ResponseMap,
    ) -> Result<StepResponse>;
}

#[async_trait]
pub trait ChildExecutable: Send + Sync {
    async fn obtain_child(&self, ctx: &StepContext) -> Result<ChildRequest>;

    async fn handle_child_response(
        &self,
        ctx: &StepContext,
        responses: &ResponseMap,
    ) -> Result<StepResponse>;
}

#[async_trait]
pub trait ChildrenExecutable: Send + Sync {
    async fn obtain_children(&self, ctx: &StepContext) -> Result<ChildrenRequest>;

    /// Called once, with a response for every child.
    async fn handle_children_response(
        &self,
        ctx: &StepContext,
        responses: &ResponseMap,
    ) -> Result<StepResponse>;
}

#[async_trait]
pub trait TaskExecutable: Send + Sync {
    async fn obtain_task(&self, ctx: &StepContext) -> Result<TaskRequest>;

    async fn handle_task_result(
        &self,
        ctx: &StepContext,
        response: &NotifyResponse,
    ) -> Result<StepResponse>;
}

/// The closed set of execution contracts.
#[derive(Clone)]
pub enum Executable {
    Sync(Arc<dyn SyncExecutable>),
    Async(Arc<dyn AsyncExecutable>),
    Child(Arc<dyn ChildExecutable>),
    Children(Arc<dyn ChildrenExecutable>),
    Task(Arc<dyn TaskExecutable>),
}

impl Executable {
    pub fn facilitator_type(&self) -> FacilitatorType {
        match self {
            Executable::Sync(_) => FacilitatorType::Sync,
            Executable::Async(_) => FacilitatorType::Async,
            Executable::Child(_) => FacilitatorType::Child,
            Executable::Children(_) => FacilitatorType::Children,
            Executable::Task(_) => FacilitatorType::Task,
        }
    }
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Executable::{}", self.facilitator_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl SyncExecutable for Noop {
        async fn execute_sync(&self, _ctx: &StepContext) -> Result<StepResponse> {
            Ok(StepResponse::succeeded())
        }
    }

    #[test]
    fn test_facilitator_type_matches_variant() {
        let exec = Executable::Sync(Arc::new(Noop));
        assert_eq!(exec.facilitator_type(), FacilitatorType::Sync);
        assert_eq!(format!("{:?}", exec), "Executable::SYNC");
    }

    #[test]
    fn test_rollback_outcome_retag_is_a_copy() {
        let original = RollbackOutcome {
            identifier: "canary".to_string(),
            rollback_info: json!({"steps": ["undo"]}),
        };
        let mut copy = original.retagged("deploy");
        copy.rollback_info["steps"] = json!([]);

        assert_eq!(copy.identifier, "deploy");
        assert_eq!(original.rollback_info["steps"][0], "undo");
    }

    #[test]
    fn test_rollback_outcome_read_from_outcomes() {
        let response = StepResponse::succeeded().with_outcome(
            ROLLBACK_OUTCOME,
            json!({"identifier": "sg", "rollbackInfo": {"a": 1}}),
        );
        let rollback = RollbackOutcome::from_outcomes(&response.outcomes).unwrap();
        assert_eq!(rollback.identifier, "sg");
    }

    #[test]
    fn test_executable_response_tagging() {
        let json = serde_json::to_value(ExecutableResponse::Children {
            child_runtime_ids: vec!["a".into()],
        })
        .unwrap();
        assert_eq!(json["type"], "children");
        assert_eq!(json["childRuntimeIds"][0], "a");
    }
}
