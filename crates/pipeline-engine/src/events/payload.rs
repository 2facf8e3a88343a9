//! Structured envelopes carried as message payloads

use pipeline_contracts::{Status, StepType};
use serde::{Deserialize, Serialize};

use crate::interrupt::InterruptType;
use crate::waiter::ResponseMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStartEvent {
    pub node_execution_id: String,
}

/// Resume a suspended node with every response it waited for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResumeEvent {
    pub node_execution_id: String,
    pub responses: ResponseMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChildPlanEvent {
    pub parent_plan_execution_id: String,
    pub parent_node_execution_id: String,
    pub plan_id: String,
    pub plan_execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusUpdateEvent {
    pub plan_execution_id: String,
    pub node_execution_id: String,
    pub plan_node_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub step_type: StepType,
}

/// Addressed by the target's ambiance; `notify_id` correlates the effect
/// back to whoever is waiting on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptEvent {
    pub interrupt_id: String,
    pub interrupt_type: InterruptType,
    pub notify_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<String>,
}
