//! Barrier instances standing per plan execution and their positions

use std::sync::Arc;

use pipeline_contracts::{step_types, Status};

use super::{BarrierExecutionInstance, BarrierPositionType, BarrierState, BarrierStore};
use crate::error::Result;
use crate::execution::NodeExecution;
use crate::persistence::update_with_retries;
use crate::plan::Plan;
use crate::steps::BarrierStepParameters;

pub struct BarrierService {
    store: Arc<dyn BarrierStore>,
    max_update_retries: u32,
}

impl BarrierService {
    pub fn new(store: Arc<dyn BarrierStore>, max_update_retries: u32) -> Self {
        Self {
            store,
            max_update_retries,
        }
    }

    /// Create one standing instance per barrier the plan declares. Barriers
    /// that already stand for the plan execution are kept as they are.
    pub async fn initialize(
        &self,
        plan_execution_id: &str,
        plan: &Plan,
    ) -> Result<Vec<BarrierExecutionInstance>> {
        let existing = self.store.find_by_plan_execution_id(plan_execution_id).await?;
        let mut created = Vec::with_capacity(plan.barriers.len());
        for setup in &plan.barriers {
            if existing.iter().any(|b| b.identifier == setup.identifier) {
                continue;
            }
            let instance = BarrierExecutionInstance::from_setup(plan_execution_id, setup);
            log::debug!(
                "Barrier '{}' standing for plan execution {} with {} positions",
                instance.identifier,
                plan_execution_id,
                instance.positions.len()
            );
            created.push(self.store.insert(instance).await?);
        }
        Ok(created)
    }

    pub async fn find(
        &self,
        plan_execution_id: &str,
        identifier: &str,
    ) -> Result<Option<BarrierExecutionInstance>> {
        self.store
            .find_by_identifier(plan_execution_id, identifier)
            .await
    }

    /// Record that `execution_id` reached the `position_type` position of
    /// plan node `setup_id`. Returns the instances this update brought
    /// down; each instance is returned by exactly one call.
    pub async fn update_position(
        &self,
        plan_execution_id: &str,
        position_type: BarrierPositionType,
        setup_id: &str,
        execution_id: &str,
    ) -> Result<Vec<BarrierExecutionInstance>> {
        let candidates = self
            .store
            .find_by_plan_execution_id(plan_execution_id)
            .await?;
        let mut brought_down = Vec::new();
        for candidate in candidates {
            if !candidate.expects(position_type, setup_id) {
                continue;
            }
            let mut flipped = false;
            let updated = update_with_retries(
                self.store.as_ref(),
                &candidate.uuid,
                self.max_update_retries,
                |instance: &mut BarrierExecutionInstance| {
                    flipped = false;
                    let Some(position) = instance.positions.iter_mut().find(|p| {
                        p.position_type == position_type
                            && p.setup_id == setup_id
                            && !p.is_filled()
                    }) else {
                        return false;
                    };
                    position.execution_id = Some(execution_id.to_string());
                    if instance.state == BarrierState::Standing && instance.is_satisfied() {
                        instance.state = BarrierState::Down;
                        flipped = true;
                    }
                    true
                },
            )
            .await?;

            if let Some(instance) = updated {
                log::debug!(
                    "Barrier '{}' position {:?}/{} reached by {}",
                    instance.identifier,
                    position_type,
                    setup_id,
                    execution_id
                );
                if flipped {
                    log::info!(
                        "Barrier '{}' of plan execution {} is down",
                        instance.identifier,
                        plan_execution_id
                    );
                    brought_down.push(instance);
                }
            }
        }
        Ok(brought_down)
    }

    /// Nodes a downed barrier releases: barrier steps referencing it that
    /// are still parked in `ASYNC_WAITING`. Any other node is ignored, even
    /// when waiting.
    pub fn release_targets(
        instance: &BarrierExecutionInstance,
        plan: &Plan,
        candidates: &[NodeExecution],
    ) -> Vec<String> {
        candidates
            .iter()
            .filter(|n| n.ambiance.plan_execution_id == instance.plan_execution_id)
            .filter(|n| n.status == Status::AsyncWaiting && !n.old_retry)
            .filter(|n| {
                if n.step_type.is(step_types::BARRIER) {
                    true
                } else {
                    log::trace!(
                        "Barrier '{}' skipping waiting node {} of type {}",
                        instance.identifier,
                        n.uuid,
                        n.step_type.type_name
                    );
                    false
                }
            })
            .filter(|n| {
                plan.find_node(&n.plan_node_id)
                    .and_then(|node| {
                        serde_json::from_value::<BarrierStepParameters>(
                            node.step_parameters.clone(),
                        )
                        .ok()
                    })
                    .is_some_and(|p| p.barrier_ref == instance.identifier)
            })
            .map(|n| n.uuid.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::InMemoryBarrierStore;
    use crate::execution::test_support::node;
    use crate::plan::PlanBuilder;
    use pipeline_contracts::{groups, FacilitatorType, StepType};
    use serde_json::json;

    fn plan() -> Plan {
        PlanBuilder::new("p", "barriers")
            .add_node("barrier-a", "wait-a", StepType::step(step_types::BARRIER), FacilitatorType::Async)
            .with_group(groups::STEP)
            .with_parameters(json!({"barrierRef": "sync"}))
            .add_node("barrier-b", "wait-b", StepType::step(step_types::BARRIER), FacilitatorType::Async)
            .with_group(groups::STEP)
            .with_parameters(json!({"barrierRef": "sync"}))
            .add_node("barrier-c", "wait-c", StepType::step(step_types::BARRIER), FacilitatorType::Async)
            .with_group(groups::STEP)
            .with_parameters(json!({"barrierRef": "sync"}))
            .add_node("approval", "approval", StepType::step("APPROVAL"), FacilitatorType::Async)
            .add_barrier(
                "sync",
                vec![
                    (BarrierPositionType::Step, "barrier-a".to_string()),
                    (BarrierPositionType::Step, "barrier-b".to_string()),
                    (BarrierPositionType::Step, "barrier-c".to_string()),
                ],
            )
            .build()
    }

    fn service() -> BarrierService {
        BarrierService::new(Arc::new(InMemoryBarrierStore::new()), 3)
    }

    #[tokio::test]
    async fn test_initialize_twice_keeps_one_instance() {
        let barriers = service();
        let plan = plan();
        assert_eq!(barriers.initialize("pe", &plan).await.unwrap().len(), 1);
        barriers
            .update_position("pe", BarrierPositionType::Step, "barrier-a", "rt-a")
            .await
            .unwrap();

        assert!(barriers.initialize("pe", &plan).await.unwrap().is_empty());
        let standing = barriers.store.find_by_plan_execution_id("pe").await.unwrap();
        assert_eq!(standing.len(), 1);
    }

    #[tokio::test]
    async fn test_two_of_three_positions_keep_barrier_standing() {
        let barriers = service();
        let plan = plan();
        barriers.initialize("pe", &plan).await.unwrap();

        let down = barriers
            .update_position("pe", BarrierPositionType::Step, "barrier-a", "rt-a")
            .await
            .unwrap();
        assert!(down.is_empty());
        let down = barriers
            .update_position("pe", BarrierPositionType::Step, "barrier-b", "rt-b")
            .await
            .unwrap();
        assert!(down.is_empty());
        assert!(!barriers.find("pe", "sync").await.unwrap().unwrap().is_down());

        let down = barriers
            .update_position("pe", BarrierPositionType::Step, "barrier-c", "rt-c")
            .await
            .unwrap();
        assert_eq!(down.len(), 1);
        assert!(down[0].is_satisfied());

        // Redelivered position update does not bring it down again
        let again = barriers
            .update_position("pe", BarrierPositionType::Step, "barrier-c", "rt-c")
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_granularity_is_ignored() {
        let barriers = service();
        barriers.initialize("pe", &plan()).await.unwrap();
        let down = barriers
            .update_position("pe", BarrierPositionType::Stage, "barrier-a", "rt-a")
            .await
            .unwrap();
        assert!(down.is_empty());
        let instance = barriers.find("pe", "sync").await.unwrap().unwrap();
        assert!(instance.positions.iter().all(|p| !p.is_filled()));
    }

    #[test]
    fn test_release_targets_only_waiting_barrier_steps() {
        let plan = plan();
        let instance = BarrierExecutionInstance::from_setup("pe", &plan.barriers[0]);

        let mut waiting = node("pe", "rt-a");
        waiting.plan_node_id = "barrier-a".into();
        waiting.step_type = StepType::step(step_types::BARRIER);
        waiting.status = Status::AsyncWaiting;

        let mut finished = waiting.clone();
        finished.uuid = "rt-b".into();
        finished.status = Status::Succeeded;

        let mut approval = node("pe", "rt-x");
        approval.plan_node_id = "approval".into();
        approval.step_type = StepType::step("APPROVAL");
        approval.status = Status::AsyncWaiting;

        let targets =
            BarrierService::release_targets(&instance, &plan, &[waiting, finished, approval]);
        assert_eq!(targets, vec!["rt-a".to_string()]);
    }
}
