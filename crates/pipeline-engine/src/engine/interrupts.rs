//! Applying registered interrupts
//!
//! An interrupt is claimed by moving it from `REGISTERED` to `PROCESSING`;
//! a redelivered message finds it claimed and does nothing. Interrupts that
//! target a node which already finished are discarded without effect.

use pipeline_contracts::Status;

use super::advice::StepOutcome;
use super::OrchestrationEngine;
use crate::advise::{AdviserResponse, AdvisingEvent};
use crate::error::{EngineError, Result};
use crate::events::{EventCategory, InterruptEvent, NodeStartEvent};
use crate::execution::NodeExecution;
use crate::interrupt::{
    Interrupt, InterruptEffect, InterruptRequest, InterruptState, InterruptType, IssuedBy,
};

impl OrchestrationEngine {
    pub async fn handle_interrupt(&self, event: InterruptEvent) -> Result<bool> {
        let Some(interrupt) = self
            .interrupts
            .transition(
                &event.interrupt_id,
                InterruptState::Registered,
                InterruptState::Processing,
            )
            .await?
        else {
            log::debug!("Interrupt {} already claimed", event.interrupt_id);
            return Ok(false);
        };

        let state = match self.apply_interrupt(&interrupt).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => {
                log::warn!(
                    "Discarding {} interrupt {}: {}",
                    interrupt.interrupt_type,
                    interrupt.uuid,
                    e
                );
                InterruptState::Discarded
            }
            Err(e) => {
                // Hand the interrupt back so the redelivery can claim it.
                self.interrupts
                    .transition(
                        &interrupt.uuid,
                        InterruptState::Processing,
                        InterruptState::Registered,
                    )
                    .await?;
                return Err(e);
            }
        };

        self.interrupts
            .transition(&interrupt.uuid, InterruptState::Processing, state)
            .await?;
        log::info!(
            "{} interrupt {} on plan execution {} {:?}",
            interrupt.interrupt_type,
            interrupt.uuid,
            interrupt.plan_execution_id,
            state
        );
        Ok(state == InterruptState::Processed)
    }

    async fn apply_interrupt(&self, interrupt: &Interrupt) -> Result<InterruptState> {
        match interrupt.interrupt_type {
            InterruptType::AbortAll => return self.abort_all(interrupt).await,
            InterruptType::Pause => return self.pause(interrupt).await,
            InterruptType::Resume => return self.resume(interrupt).await,
            _ => {}
        }

        let node_id = interrupt.node_execution_id.as_deref().ok_or_else(|| {
            EngineError::invalid(format!(
                "{} interrupt {} has no node",
                interrupt.interrupt_type, interrupt.uuid
            ))
        })?;
        let node = self.nodes.get(node_id).await?;
        if node.is_final() {
            log::warn!(
                "Node {} already {}, discarding {} interrupt {}",
                node.uuid,
                node.status,
                interrupt.interrupt_type,
                interrupt.uuid
            );
            return Ok(InterruptState::Discarded);
        }

        match interrupt.interrupt_type {
            InterruptType::Abort => self.abort_node(&node, interrupt).await,
            InterruptType::Retry => self.retry_intervention(&node, interrupt).await,
            InterruptType::MarkSuccess | InterruptType::MarkFailed | InterruptType::Ignore => {
                self.resolve_intervention(&node, interrupt).await
            }
            InterruptType::AbortAll | InterruptType::Pause | InterruptType::Resume => {
                Ok(InterruptState::Discarded)
            }
        }
    }

    /// Stop one node. Suspended nodes abort right away, running ones are
    /// asked to discontinue and abort at their next suspension point.
    /// Returns the node if it is aborted now.
    async fn abort_one(
        &self,
        node: &NodeExecution,
        effect: &InterruptEffect,
    ) -> Result<Option<NodeExecution>> {
        match node.status {
            Status::Running => {
                self.set_status_from(&node.uuid, &[Status::Running], Status::Discontinuing, |n| {
                    n.interrupt_histories.push(effect.clone());
                })
                .await?;
                Ok(None)
            }
            status if status.is_suspended() => {
                self.waiter.cancel(&node.uuid);
                self.timeouts.cancel_for_node(&node.uuid);
                self.set_status(&node.uuid, Status::Aborted, |n| {
                    n.interrupt_histories.push(effect.clone());
                })
                .await
            }
            _ => Ok(None),
        }
    }

    /// ABORT: the target and everything below it. Only the target reports
    /// to its parent; its descendants' callbacks are cancelled with it.
    async fn abort_node(
        &self,
        node: &NodeExecution,
        interrupt: &Interrupt,
    ) -> Result<InterruptState> {
        let effect = InterruptEffect::of(interrupt);
        let live: Vec<Status> = Status::ALL.into_iter().filter(|s| !s.is_final()).collect();
        let tree = self
            .nodes
            .find_all_children_with_status_in(
                node.plan_execution_id(),
                Some(&node.uuid),
                &live,
                true,
            )
            .await?;

        let mut target = None;
        for member in &tree {
            if let Some(aborted) = self.abort_one(member, &effect).await? {
                if aborted.uuid == node.uuid {
                    target = Some(aborted);
                }
            }
        }
        if let Some(target) = target {
            self.conclude(&target).await?;
        }
        Ok(InterruptState::Processed)
    }

    /// ABORT_ALL: every live node, the plan execution and every chained
    /// plan still running.
    async fn abort_all(&self, interrupt: &Interrupt) -> Result<InterruptState> {
        let plan_execution = self
            .plan_executions
            .get(&interrupt.plan_execution_id)
            .await?;
        if plan_execution.status.is_final() {
            return Ok(InterruptState::Discarded);
        }

        let effect = InterruptEffect::of(interrupt);
        let active = self.nodes.active_nodes(&plan_execution.uuid).await?;
        for node in &active {
            self.abort_one(node, &effect).await?;
        }
        self.end_plan(&plan_execution.uuid, Status::Aborted, None).await?;

        for child in self
            .plan_executions
            .find_child_plans(&plan_execution.uuid)
            .await?
            .into_iter()
            .filter(|c| !c.status.is_final())
        {
            log::info!(
                "Cascading abort of {} to chained plan execution {}",
                plan_execution.uuid,
                child.uuid
            );
            if let Err(e) = self
                .interrupts
                .register(InterruptRequest::new(
                    InterruptType::AbortAll,
                    child.uuid.clone(),
                    IssuedBy::System,
                ))
                .await
            {
                log::warn!("Could not abort chained plan execution {}: {}", child.uuid, e);
            }
        }
        Ok(InterruptState::Processed)
    }

    async fn pause(&self, interrupt: &Interrupt) -> Result<InterruptState> {
        let effect = InterruptEffect::of(interrupt);
        if let Some(node_id) = &interrupt.node_execution_id {
            let paused = self
                .set_status_from(node_id, &[Status::Queued], Status::Paused, |n| {
                    n.interrupt_histories.push(effect.clone());
                })
                .await?;
            return Ok(Self::processed_if(paused.is_some()));
        }

        let Some(plan_execution) = self
            .plan_executions
            .update_status(&interrupt.plan_execution_id, Status::Paused, |_| {})
            .await?
        else {
            return Ok(InterruptState::Discarded);
        };
        let queued = self
            .nodes
            .find_all_children_with_status_in(&plan_execution.uuid, None, &[Status::Queued], false)
            .await?;
        for node in queued {
            self.set_status_from(&node.uuid, &[Status::Queued], Status::Paused, |n| {
                n.interrupt_histories.push(effect.clone());
            })
            .await?;
        }
        Ok(InterruptState::Processed)
    }

    async fn resume(&self, interrupt: &Interrupt) -> Result<InterruptState> {
        let effect = InterruptEffect::of(interrupt);
        let paused = match &interrupt.node_execution_id {
            Some(node_id) => vec![self.nodes.get(node_id).await?],
            None => {
                if self
                    .plan_executions
                    .update_status(&interrupt.plan_execution_id, Status::Running, |_| {})
                    .await?
                    .is_none()
                {
                    return Ok(InterruptState::Discarded);
                }
                self.nodes
                    .find_all_children_with_status_in(
                        &interrupt.plan_execution_id,
                        None,
                        &[Status::Paused],
                        false,
                    )
                    .await?
            }
        };

        let mut resumed = 0;
        for node in paused {
            if let Some(queued) = self
                .set_status_from(&node.uuid, &[Status::Paused], Status::Queued, |n| {
                    n.interrupt_histories.push(effect.clone());
                })
                .await?
            {
                self.republish_start(&queued).await?;
                resumed += 1;
            }
        }
        log::debug!("Resumed {} paused nodes", resumed);
        Ok(if interrupt.node_execution_id.is_some() {
            Self::processed_if(resumed > 0)
        } else {
            InterruptState::Processed
        })
    }

    async fn republish_start(&self, node: &NodeExecution) -> Result<()> {
        let event = NodeStartEvent {
            node_execution_id: node.uuid.clone(),
        };
        self.publish(&node.ambiance, EventCategory::NodeStart, &event, false)
            .await?;
        Ok(())
    }

    /// RETRY of a node waiting for intervention.
    async fn retry_intervention(
        &self,
        node: &NodeExecution,
        interrupt: &Interrupt,
    ) -> Result<InterruptState> {
        if node.status != Status::InterventionWaiting {
            return Ok(InterruptState::Discarded);
        }
        self.timeouts.cancel_for_node(&node.uuid);
        let outcome = StepOutcome {
            status: Status::Failed,
            failure_info: node.failure_info.clone(),
            outcomes: node.outcomes.clone(),
        };
        let retried = self
            .retry_node(
                node,
                &outcome,
                node.adviser_response.clone(),
                0,
                Some(InterruptEffect::of(interrupt)),
            )
            .await?;
        Ok(Self::processed_if(retried))
    }

    /// MARK_SUCCESS, MARK_FAILED and IGNORE of a node waiting for
    /// intervention. The node is advised again from `INTERVENTION_WAITING`;
    /// when nothing applies, a positive resolution continues where the
    /// intervention would have.
    async fn resolve_intervention(
        &self,
        node: &NodeExecution,
        interrupt: &Interrupt,
    ) -> Result<InterruptState> {
        if node.status != Status::InterventionWaiting {
            return Ok(InterruptState::Discarded);
        }
        self.timeouts.cancel_for_node(&node.uuid);

        let to = match interrupt.interrupt_type {
            InterruptType::MarkSuccess => Status::Succeeded,
            InterruptType::Ignore => Status::IgnoreFailed,
            _ => Status::Failed,
        };
        let effect = InterruptEffect::of(interrupt);
        let node = self
            .nodes
            .update(&node.uuid, |n| n.interrupt_histories.push(effect.clone()))
            .await?;

        let (_, plan_node) = self.plan_node_of(&node)?;
        let event = AdvisingEvent {
            ambiance: node.ambiance.clone(),
            node_execution_id: node.uuid.clone(),
            to_status: to,
            from_status: Status::InterventionWaiting,
            failure_info: node.failure_info.clone(),
            retry_ids: node.retry_ids.clone(),
            previous_adviser_expired: interrupt.issued_by.is_timeout(),
        };
        let advice = self.advise_node(&plan_node, &event).or_else(|| {
            let Some(AdviserResponse::InterventionWait { next_node_id, .. }) = &node.adviser_response
            else {
                return None;
            };
            to.is_positive().then(|| {
                (
                    interrupt.interrupt_type.as_str().to_string(),
                    AdviserResponse::NextStep {
                        next_node_id: next_node_id.clone(),
                    },
                )
            })
        });

        let outcome = StepOutcome {
            status: to,
            failure_info: if to == Status::Succeeded {
                None
            } else {
                node.failure_info.clone()
            },
            outcomes: node.outcomes.clone(),
        };
        self.apply_advice(&node, outcome, advice).await?;
        Ok(InterruptState::Processed)
    }

    fn processed_if(applied: bool) -> InterruptState {
        if applied {
            InterruptState::Processed
        } else {
            InterruptState::Discarded
        }
    }
}
