//! Fluent builder for execution plans

use std::sync::Arc;

use pipeline_contracts::{FacilitatorType, StepType};
use serde::Serialize;
use serde_json::Value;

use super::{AdviserObtainment, BarrierPositionSetup, BarrierSetup, Plan, PlanNode};
use crate::barrier::BarrierPositionType;
use crate::codec::{self, Codec, JsonCodec};
use crate::error::Result;

/// Fluent builder for constructing plans programmatically
///
/// # Example
///
/// ```ignore
/// let plan = PlanBuilder::new("plan-1", "Deploy")
///     .add_node("stage", "deploy", StepType::new("SECTION", StepCategory::Stage), FacilitatorType::Child)
///     .with_group(groups::STAGE)
///     .with_parameters(json!({"childNodeId": "shell"}))
///     .add_node("shell", "shell", StepType::step("SHELL"), FacilitatorType::Sync)
///     .with_adviser("MANUAL_INTERVENTION", &params)?
///     .start_at("stage")
///     .build();
/// ```
pub struct PlanBuilder {
    uuid: String,
    name: String,
    start_node_id: Option<String>,
    rollback_node_id: Option<String>,
    nodes: Vec<PlanNode>,
    barriers: Vec<BarrierSetup>,
    codec: Arc<dyn Codec>,
}

impl PlanBuilder {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            start_node_id: None,
            rollback_node_id: None,
            nodes: Vec::new(),
            barriers: Vec::new(),
            codec: Arc::new(JsonCodec),
        }
    }

    /// Codec used to encode adviser parameters. Must match the engine's.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Add a node. The identifier doubles as its display name.
    pub fn add_node(
        mut self,
        uuid: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
        facilitator: FacilitatorType,
    ) -> Self {
        let identifier = identifier.into();
        self.nodes.push(PlanNode {
            uuid: uuid.into(),
            name: identifier.clone(),
            identifier,
            group: None,
            step_type,
            facilitator,
            step_parameters: Value::Null,
            adviser_obtainments: Vec::new(),
        });
        self
    }

    /// Set the group of the most recently added node
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.group = Some(group.into());
        }
        self
    }

    /// Set step parameters on the most recently added node
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.step_parameters = parameters;
        }
        self
    }

    /// Append an adviser to the most recently added node
    pub fn with_adviser<P: Serialize>(mut self, adviser_type: &str, parameters: &P) -> Result<Self> {
        let bytes = codec::encode(self.codec.as_ref(), adviser_type, parameters)?;
        if let Some(node) = self.nodes.last_mut() {
            node.adviser_obtainments.push(AdviserObtainment {
                adviser_type: adviser_type.to_string(),
                parameters: bytes,
            });
        }
        Ok(self)
    }

    pub fn add_barrier(
        mut self,
        identifier: impl Into<String>,
        positions: Vec<(BarrierPositionType, String)>,
    ) -> Self {
        self.barriers.push(BarrierSetup {
            identifier: identifier.into(),
            positions: positions
                .into_iter()
                .map(|(position_type, setup_id)| BarrierPositionSetup {
                    position_type,
                    setup_id,
                })
                .collect(),
        });
        self
    }

    pub fn start_at(mut self, node_id: impl Into<String>) -> Self {
        self.start_node_id = Some(node_id.into());
        self
    }

    pub fn rollback_at(mut self, node_id: impl Into<String>) -> Self {
        self.rollback_node_id = Some(node_id.into());
        self
    }

    /// Build the plan without validation. Starts at the first node unless
    /// `start_at` was called.
    pub fn build(self) -> Plan {
        let start_node_id = self
            .start_node_id
            .or_else(|| self.nodes.first().map(|n| n.uuid.clone()))
            .unwrap_or_default();
        Plan {
            uuid: self.uuid,
            name: self.name,
            start_node_id,
            nodes: self.nodes,
            barriers: self.barriers,
            rollback_node_id: self.rollback_node_id,
        }
    }

    /// Build and validate
    pub fn build_validated(self) -> Result<Plan> {
        let plan = self.build();
        plan.validate()?;
        Ok(plan)
    }
}
