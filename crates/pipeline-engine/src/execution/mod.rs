//! Node and plan execution records
//!
//! A [`NodeExecution`] is the runtime record of one plan node instance. It is
//! created `QUEUED` when the node is scheduled, owned and mutated only by the
//! engine through [`NodeExecutionService`], and archived (never deleted)
//! once its plan completes.

mod archive;
mod plan_execution;
mod service;

pub use archive::ExecutionArchive;
pub use plan_execution::{
    InMemoryPlanExecutionStore, ParentPlanInfo, PlanExecution, PlanExecutionService,
    PlanExecutionStore,
};
pub use service::NodeExecutionService;

use std::collections::BTreeMap;

use async_trait::async_trait;
use pipeline_contracts::{Ambiance, FacilitatorType, FailureInfo, Status, StepType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::advise::AdviserResponse;
use crate::error::Result;
use crate::executable::ExecutableResponse;
use crate::interrupt::InterruptEffect;
use crate::persistence::{Versioned, VersionedMap, VersionedStore};
use crate::plan::PlanNode;

/// Runtime record of one plan node instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    /// Runtime id
    pub uuid: String,
    /// Path to this node, ending with its own level
    pub ambiance: Ambiance,
    pub plan_node_id: String,
    pub identifier: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub step_type: StepType,
    pub facilitator: FacilitatorType,
    pub status: Status,

    /// Node that spawned this one as a child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_id: Option<String>,
    /// Correlation id this node reports its result under. `None` for the
    /// top level chain of a plan, whose last node ends the plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcomes: BTreeMap<String, Value>,
    #[serde(default)]
    pub interrupt_histories: Vec<InterruptEffect>,
    /// Runtime ids of every earlier attempt, oldest first
    #[serde(default)]
    pub retry_ids: Vec<String>,
    /// Superseded by a retry
    #[serde(default)]
    pub old_retry: bool,
    /// Step parameters as encoded by the engine codec when the node started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_step_parameters: Option<Vec<u8>>,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adviser_response: Option<AdviserResponse>,
    #[serde(default)]
    pub timeout_instance_ids: Vec<String>,

    pub start_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<i64>,
    pub last_updated_at: i64,
    #[serde(default)]
    pub version: u64,
}

impl NodeExecution {
    /// A queued execution of `plan_node`. `ambiance` must already end with
    /// the node's own level.
    pub fn queued(ambiance: Ambiance, plan_node: &PlanNode) -> Self {
        let now = crate::now_millis();
        let uuid = ambiance
            .current_runtime_id()
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            uuid,
            ambiance,
            plan_node_id: plan_node.uuid.clone(),
            identifier: plan_node.identifier.clone(),
            name: plan_node.name.clone(),
            group: plan_node.group.clone(),
            step_type: plan_node.step_type.clone(),
            facilitator: plan_node.facilitator,
            status: Status::Queued,
            parent_id: None,
            previous_id: None,
            next_id: None,
            notify_id: None,
            failure_info: None,
            outcomes: BTreeMap::new(),
            interrupt_histories: Vec::new(),
            retry_ids: Vec::new(),
            old_retry: false,
            resolved_step_parameters: None,
            executable_responses: Vec::new(),
            adviser_response: None,
            timeout_instance_ids: Vec::new(),
            start_ts: now,
            end_ts: None,
            last_updated_at: now,
            version: 0,
        }
    }

    pub fn plan_execution_id(&self) -> &str {
        &self.ambiance.plan_execution_id
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    /// Counts toward the live state of a plan: not finished and not
    /// replaced by a retry.
    pub fn is_active(&self) -> bool {
        !self.old_retry && !self.status.is_final()
    }
}

impl Versioned for NodeExecution {
    const KIND: &'static str = "NodeExecution";

    fn id(&self) -> &str {
        &self.uuid
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Persistence boundary for node executions.
#[async_trait]
pub trait NodeExecutionStore: VersionedStore<NodeExecution> {
    /// Every node execution of a plan execution, in start order.
    async fn find_by_plan_execution_id(&self, plan_execution_id: &str)
        -> Result<Vec<NodeExecution>>;

    /// Direct children of `parent_id`.
    async fn find_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>>;
}

pub type InMemoryNodeExecutionStore = VersionedMap<NodeExecution>;

fn by_start(mut nodes: Vec<NodeExecution>) -> Vec<NodeExecution> {
    nodes.sort_by(|a, b| a.start_ts.cmp(&b.start_ts).then(a.uuid.cmp(&b.uuid)));
    nodes
}

#[async_trait]
impl NodeExecutionStore for VersionedMap<NodeExecution> {
    async fn find_by_plan_execution_id(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<NodeExecution>> {
        Ok(by_start(
            self.find(|n| n.ambiance.plan_execution_id == plan_execution_id),
        ))
    }

    async fn find_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
        Ok(by_start(
            self.find(|n| n.parent_id.as_deref() == Some(parent_id)),
        ))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use pipeline_contracts::{groups, Level};

    pub fn plan_node(id: &str, step_type: &str, facilitator: FacilitatorType) -> PlanNode {
        PlanNode {
            uuid: id.to_string(),
            identifier: id.to_string(),
            name: id.to_string(),
            group: Some(groups::STEP.to_string()),
            step_type: StepType::step(step_type),
            facilitator,
            step_parameters: Value::Null,
            adviser_obtainments: Vec::new(),
        }
    }

    /// Queued node `runtime_id` of plan execution `plan_execution_id`.
    pub fn node(plan_execution_id: &str, runtime_id: &str) -> NodeExecution {
        let plan_node = plan_node(runtime_id, "SHELL", FacilitatorType::Sync);
        let ambiance = Ambiance::new(plan_execution_id, "plan").clone_for_child(
            Level::new(runtime_id, runtime_id, runtime_id, plan_node.step_type.clone())
                .with_group(groups::STEP),
        );
        NodeExecution::queued(ambiance, &plan_node)
    }

    pub fn child_of(parent: &NodeExecution, runtime_id: &str) -> NodeExecution {
        let plan_node = plan_node(runtime_id, "SHELL", FacilitatorType::Sync);
        let ambiance = parent.ambiance.clone_for_child(Level::new(
            runtime_id,
            runtime_id,
            runtime_id,
            plan_node.step_type.clone(),
        ));
        let mut child = NodeExecution::queued(ambiance, &plan_node);
        child.parent_id = Some(parent.uuid.clone());
        child.notify_id = Some(runtime_id.to_string());
        child
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_queued_takes_runtime_id_from_ambiance() {
        let n = node("pe-1", "rt-1");
        assert_eq!(n.uuid, "rt-1");
        assert_eq!(n.status, Status::Queued);
        assert_eq!(n.plan_execution_id(), "pe-1");
        assert!(n.is_active());
    }

    #[tokio::test]
    async fn test_find_by_plan_and_children() {
        let store = InMemoryNodeExecutionStore::new();
        let parent = node("pe-1", "fork");
        store.insert(parent.clone()).await.unwrap();
        store.insert(child_of(&parent, "a")).await.unwrap();
        store.insert(child_of(&parent, "b")).await.unwrap();
        store.insert(node("pe-2", "other")).await.unwrap();

        assert_eq!(store.find_by_plan_execution_id("pe-1").await.unwrap().len(), 3);
        let children = store.find_children("fork").await.unwrap();
        let ids: Vec<_> = children.iter().map(|c| c.uuid.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a") && ids.contains(&"b"));
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(node("pe-1", "rt-1")).unwrap();
        assert_eq!(json["planNodeId"], "rt-1");
        assert_eq!(json["status"], "QUEUED");
        assert!(json.get("notifyId").is_none());
    }
}
