//! Barrier bookkeeping driven by node status updates

use pipeline_contracts::{step_types, Status};

use super::OrchestrationEngine;
use crate::barrier::{BarrierPositionType, BarrierService};
use crate::error::Result;
use crate::events::NodeStatusUpdateEvent;
use crate::steps::BarrierStepParameters;
use crate::waiter::NotifyResponse;

impl OrchestrationEngine {
    /// Fill barrier positions from a status change and release the barrier
    /// steps of every barrier that went down.
    ///
    /// Stage and step group positions are reached when the section starts
    /// running; step positions when the barrier step parks.
    pub async fn handle_status_update(&self, event: NodeStatusUpdateEvent) -> Result<bool> {
        let Some(position_type) = BarrierPositionType::from_group(event.group.as_deref()) else {
            return Ok(false);
        };
        let parked_barrier_step =
            event.step_type.is(step_types::BARRIER) && event.status == Status::AsyncWaiting;
        let reached = match position_type {
            BarrierPositionType::Stage | BarrierPositionType::StepGroup => {
                event.status == Status::Running
            }
            BarrierPositionType::Step => parked_barrier_step,
        };
        if !reached {
            return Ok(false);
        }

        let plan_execution_id = event.plan_execution_id.as_str();
        let mut downed = self
            .barriers
            .update_position(
                plan_execution_id,
                position_type,
                &event.plan_node_id,
                &event.node_execution_id,
            )
            .await?;

        let plan_execution = self.plan_executions.get(plan_execution_id).await?;
        let plan = self.plans.get_plan(&plan_execution.plan_id)?;

        // A barrier step parking after its barrier went down passes through.
        if parked_barrier_step {
            let barrier_ref = plan
                .find_node(&event.plan_node_id)
                .and_then(|n| {
                    serde_json::from_value::<BarrierStepParameters>(n.step_parameters.clone()).ok()
                })
                .map(|p| p.barrier_ref);
            if let Some(barrier_ref) = barrier_ref {
                if let Some(instance) = self.barriers.find(plan_execution_id, &barrier_ref).await? {
                    if instance.is_down() && !downed.iter().any(|d| d.uuid == instance.uuid) {
                        downed.push(instance);
                    }
                }
            }
        }
        if downed.is_empty() {
            return Ok(true);
        }

        let waiting = self
            .nodes
            .find_all_children_with_status_in(
                plan_execution_id,
                None,
                &[Status::AsyncWaiting],
                false,
            )
            .await?;
        for instance in &downed {
            for node_id in BarrierService::release_targets(instance, &plan, &waiting) {
                log::debug!("Barrier '{}' releasing node {}", instance.identifier, node_id);
                self.notify_in(
                    plan_execution_id,
                    &node_id,
                    NotifyResponse::new(Status::Succeeded).with_identifier(&instance.identifier),
                )
                .await?;
            }
        }
        Ok(true)
    }
}
