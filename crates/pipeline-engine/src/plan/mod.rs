//! Static execution plans
//!
//! A [`Plan`] is the authoring-time graph the engine walks: every
//! [`PlanNode`] names its step type, its facilitator contract, its step
//! parameters and the ordered adviser obtainments evaluated when it ends.

mod builder;
mod store;

pub use builder::PlanBuilder;
pub use store::{PlanMetadata, PlanStore};

use std::collections::HashSet;

use pipeline_contracts::{FacilitatorType, StepType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::barrier::BarrierPositionType;
use crate::error::{EngineError, Result};

/// An adviser attached to a plan node. Parameters are codec encoded under
/// the adviser type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdviserObtainment {
    pub adviser_type: String,
    #[serde(default)]
    pub parameters: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    pub uuid: String,
    pub identifier: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub step_type: StepType,
    pub facilitator: FacilitatorType,
    #[serde(default)]
    pub step_parameters: Value,
    /// Evaluated in order; the first adviser that can advise wins
    #[serde(default)]
    pub adviser_obtainments: Vec<AdviserObtainment>,
}

/// One declared position of a barrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarrierPositionSetup {
    pub position_type: BarrierPositionType,
    /// Plan node that fills this position
    pub setup_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarrierSetup {
    pub identifier: String,
    pub positions: Vec<BarrierPositionSetup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub uuid: String,
    pub name: String,
    pub start_node_id: String,
    pub nodes: Vec<PlanNode>,
    #[serde(default)]
    pub barriers: Vec<BarrierSetup>,
    /// Entry of the rollback section run when pipeline rollback is requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_node_id: Option<String>,
}

impl Plan {
    pub fn find_node(&self, node_id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.uuid == node_id)
    }

    pub fn node(&self, node_id: &str) -> Result<&PlanNode> {
        self.find_node(node_id)
            .ok_or_else(|| EngineError::not_found("PlanNode", node_id))
    }

    /// Check internal references before the plan is stored or run.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.uuid.as_str()) {
                return Err(EngineError::invalid(format!(
                    "plan '{}' has duplicate node id '{}'",
                    self.uuid, node.uuid
                )));
            }
        }
        if !seen.contains(self.start_node_id.as_str()) {
            return Err(EngineError::invalid(format!(
                "plan '{}' start node '{}' does not exist",
                self.uuid, self.start_node_id
            )));
        }
        if let Some(rollback) = &self.rollback_node_id {
            if !seen.contains(rollback.as_str()) {
                return Err(EngineError::invalid(format!(
                    "plan '{}' rollback node '{}' does not exist",
                    self.uuid, rollback
                )));
            }
        }
        for barrier in &self.barriers {
            if barrier.positions.is_empty() {
                return Err(EngineError::invalid(format!(
                    "barrier '{}' declares no positions",
                    barrier.identifier
                )));
            }
            for position in &barrier.positions {
                if !seen.contains(position.setup_id.as_str()) {
                    return Err(EngineError::invalid(format!(
                        "barrier '{}' references unknown node '{}'",
                        barrier.identifier, position.setup_id
                    )));
                }
            }
        }
        Ok(())
    }
}
