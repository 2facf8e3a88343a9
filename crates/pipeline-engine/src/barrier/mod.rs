//! Barriers: named rendezvous points across parallel branches
//!
//! A barrier instance exists per plan execution and barrier identifier. Each
//! declared position is filled by the node that reaches it; once every
//! position is filled the instance goes down and every barrier step parked
//! on it is released.

mod service;

pub use service::BarrierService;

use std::collections::BTreeMap;

use async_trait::async_trait;
use pipeline_contracts::groups;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::persistence::{Versioned, VersionedMap, VersionedStore};
use crate::plan::BarrierSetup;

/// Granularity of a barrier position, outer to inner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarrierPositionType {
    Stage,
    StepGroup,
    Step,
}

impl BarrierPositionType {
    /// Position bucket a node fills, from its group.
    pub fn from_group(group: Option<&str>) -> Option<Self> {
        match group? {
            groups::STAGE => Some(BarrierPositionType::Stage),
            groups::STEP_GROUP => Some(BarrierPositionType::StepGroup),
            groups::STEP => Some(BarrierPositionType::Step),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarrierPosition {
    pub position_type: BarrierPositionType,
    /// Plan node expected to reach this position
    pub setup_id: String,
    /// Node execution that reached it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

impl BarrierPosition {
    pub fn is_filled(&self) -> bool {
        self.execution_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarrierState {
    Standing,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarrierExecutionInstance {
    pub uuid: String,
    pub identifier: String,
    pub plan_execution_id: String,
    pub positions: Vec<BarrierPosition>,
    pub state: BarrierState,
    #[serde(default)]
    pub version: u64,
}

impl BarrierExecutionInstance {
    pub fn from_setup(plan_execution_id: &str, setup: &BarrierSetup) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            identifier: setup.identifier.clone(),
            plan_execution_id: plan_execution_id.to_string(),
            positions: setup
                .positions
                .iter()
                .map(|p| BarrierPosition {
                    position_type: p.position_type,
                    setup_id: p.setup_id.clone(),
                    execution_id: None,
                })
                .collect(),
            state: BarrierState::Standing,
            version: 0,
        }
    }

    /// All declared positions are filled.
    pub fn is_satisfied(&self) -> bool {
        self.positions.iter().all(BarrierPosition::is_filled)
    }

    pub fn is_down(&self) -> bool {
        self.state == BarrierState::Down
    }

    pub fn positions_by_type(&self) -> BTreeMap<BarrierPositionType, Vec<&BarrierPosition>> {
        let mut by_type: BTreeMap<_, Vec<_>> = BTreeMap::new();
        for position in &self.positions {
            by_type.entry(position.position_type).or_default().push(position);
        }
        by_type
    }

    /// Whether an unfilled `position_type` position exists for `setup_id`.
    pub fn expects(&self, position_type: BarrierPositionType, setup_id: &str) -> bool {
        self.positions
            .iter()
            .any(|p| p.position_type == position_type && p.setup_id == setup_id && !p.is_filled())
    }
}

impl Versioned for BarrierExecutionInstance {
    const KIND: &'static str = "BarrierExecutionInstance";

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

#[async_trait]
pub trait BarrierStore: VersionedStore<BarrierExecutionInstance> {
    async fn find_by_plan_execution_id(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<BarrierExecutionInstance>>;

    async fn find_by_identifier(
        &self,
        plan_execution_id: &str,
        identifier: &str,
    ) -> Result<Option<BarrierExecutionInstance>> {
        Ok(self
            .find_by_plan_execution_id(plan_execution_id)
            .await?
            .into_iter()
            .find(|b| b.identifier == identifier))
    }
}

pub type InMemoryBarrierStore = VersionedMap<BarrierExecutionInstance>;

#[async_trait]
impl BarrierStore for VersionedMap<BarrierExecutionInstance> {
    async fn find_by_plan_execution_id(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<BarrierExecutionInstance>> {
        Ok(self.find(|b| b.plan_execution_id == plan_execution_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::BarrierPositionSetup;

    fn setup() -> BarrierSetup {
        BarrierSetup {
            identifier: "sync".into(),
            positions: vec![
                BarrierPositionSetup {
                    position_type: BarrierPositionType::Stage,
                    setup_id: "stage-a".into(),
                },
                BarrierPositionSetup {
                    position_type: BarrierPositionType::Step,
                    setup_id: "barrier-a".into(),
                },
                BarrierPositionSetup {
                    position_type: BarrierPositionType::Step,
                    setup_id: "barrier-b".into(),
                },
            ],
        }
    }

    #[test]
    fn test_position_type_from_group() {
        assert_eq!(
            BarrierPositionType::from_group(Some(groups::STEP_GROUP)),
            Some(BarrierPositionType::StepGroup)
        );
        assert_eq!(BarrierPositionType::from_group(Some(groups::STAGES)), None);
        assert_eq!(BarrierPositionType::from_group(None), None);
    }

    #[test]
    fn test_satisfied_only_when_all_filled() {
        let mut instance = BarrierExecutionInstance::from_setup("pe", &setup());
        assert!(!instance.is_satisfied());
        assert!(instance.expects(BarrierPositionType::Step, "barrier-a"));
        assert!(!instance.expects(BarrierPositionType::Stage, "barrier-a"));

        instance.positions[0].execution_id = Some("x".into());
        instance.positions[1].execution_id = Some("y".into());
        assert!(!instance.is_satisfied());
        instance.positions[2].execution_id = Some("z".into());
        assert!(instance.is_satisfied());

        let by_type = instance.positions_by_type();
        assert_eq!(by_type[&BarrierPositionType::Step].len(), 2);
        assert_eq!(by_type[&BarrierPositionType::Stage].len(), 1);
    }
}
