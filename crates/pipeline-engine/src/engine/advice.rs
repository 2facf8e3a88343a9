//! Advising finished steps and carrying out the advice

use std::collections::BTreeMap;

use pipeline_contracts::{FailureInfo, Status};
use serde_json::Value;

use super::{NodeLinks, OrchestrationEngine};
use crate::advise::{AdviserResponse, AdvisingEvent};
use crate::error::Result;
use crate::executable::StepResponse;
use crate::execution::NodeExecution;
use crate::interrupt::{InterruptEffect, InterruptRequest, InterruptType, IssuedBy};
use crate::plan::PlanNode;

/// What a node finished with, before advice decides its fate.
#[derive(Debug, Clone)]
pub(super) struct StepOutcome {
    pub status: Status,
    pub failure_info: Option<FailureInfo>,
    pub outcomes: BTreeMap<String, Value>,
}

impl From<StepResponse> for StepOutcome {
    fn from(response: StepResponse) -> Self {
        Self {
            status: response.status,
            failure_info: response.failure_info,
            outcomes: response.outcomes,
        }
    }
}

impl OrchestrationEngine {
    /// Advise a node that produced `response` and apply the advice.
    pub(super) async fn process_step_response(
        &self,
        node_execution_id: &str,
        response: StepResponse,
    ) -> Result<bool> {
        let node = self.nodes.get(node_execution_id).await?;
        if node.is_final() {
            log::debug!("Node {} already {}", node.uuid, node.status);
            return Ok(false);
        }
        if node.status == Status::Discontinuing {
            return self.finish_discontinued(&node.uuid).await;
        }

        let mut outcome = StepOutcome::from(response);
        if !outcome.status.is_final() {
            log::error!(
                "Node {} returned non terminal status {}, marking it errored",
                node.uuid,
                outcome.status
            );
            outcome.status = Status::Errored;
        }

        let (_, plan_node) = self.plan_node_of(&node)?;
        let event = AdvisingEvent {
            ambiance: node.ambiance.clone(),
            node_execution_id: node.uuid.clone(),
            to_status: outcome.status,
            from_status: node.status,
            failure_info: outcome.failure_info.clone(),
            retry_ids: node.retry_ids.clone(),
            previous_adviser_expired: false,
        };
        let advice = self.advise_node(&plan_node, &event);
        self.apply_advice(&node, outcome, advice).await
    }

    /// A broken adviser setup must not wedge the node; it concludes as if
    /// nothing applied.
    pub(super) fn advise_node(
        &self,
        plan_node: &PlanNode,
        event: &AdvisingEvent,
    ) -> Option<(String, AdviserResponse)> {
        match self.advise.advise(&plan_node.adviser_obtainments, event) {
            Ok(advice) => advice,
            Err(e) => {
                log::error!("Advising node {} failed: {}", event.node_execution_id, e);
                None
            }
        }
    }

    pub(super) async fn apply_advice(
        &self,
        node: &NodeExecution,
        outcome: StepOutcome,
        advice: Option<(String, AdviserResponse)>,
    ) -> Result<bool> {
        let advice = advice.filter(|(_, response)| {
            !(node.status == Status::InterventionWaiting
                && matches!(response, AdviserResponse::InterventionWait { .. }))
        });
        let Some((adviser_type, response)) = advice else {
            return match self.finalize(&node.uuid, outcome.status, &outcome, None).await? {
                Some(done) => self.conclude(&done).await,
                None => Ok(false),
            };
        };

        match response.clone() {
            AdviserResponse::NextStep { next_node_id } => {
                match self
                    .finalize(&node.uuid, outcome.status, &outcome, Some(response))
                    .await?
                {
                    Some(done) => self.continue_or_conclude(&done, next_node_id).await,
                    None => Ok(false),
                }
            }
            AdviserResponse::Retry { wait_interval_ms } => {
                self.retry_node(node, &outcome, Some(response), wait_interval_ms, None)
                    .await
            }
            AdviserResponse::InterventionWait {
                timeout_ms,
                repair_action_code,
                ..
            } => {
                let timeout_instance_id =
                    self.timeouts
                        .schedule(node, timeout_ms, repair_action_code)?;
                let Some(waiting) = self
                    .set_status(&node.uuid, Status::InterventionWaiting, |n| {
                        n.failure_info = outcome.failure_info.clone();
                        n.outcomes = outcome.outcomes.clone();
                        n.adviser_response = Some(response.clone());
                        n.timeout_instance_ids.push(timeout_instance_id.clone());
                    })
                    .await?
                else {
                    self.timeouts.cancel_for_node(&node.uuid);
                    return Ok(false);
                };
                log::info!(
                    "Node {} ({}) waiting for intervention, {:?} in {}ms",
                    waiting.uuid,
                    waiting.identifier,
                    repair_action_code,
                    timeout_ms
                );
                Ok(true)
            }
            AdviserResponse::MarkSuccess { next_node_id } => {
                let outcome = StepOutcome {
                    failure_info: None,
                    ..outcome
                };
                match self
                    .finalize(&node.uuid, Status::Succeeded, &outcome, Some(response))
                    .await?
                {
                    Some(done) => self.continue_or_conclude(&done, next_node_id).await,
                    None => Ok(false),
                }
            }
            AdviserResponse::Ignore { next_node_id } => {
                match self
                    .finalize(&node.uuid, Status::IgnoreFailed, &outcome, Some(response))
                    .await?
                {
                    Some(done) => self.continue_or_conclude(&done, next_node_id).await,
                    None => Ok(false),
                }
            }
            AdviserResponse::EndPlan { is_abort } => {
                let Some(done) = self
                    .finalize(&node.uuid, outcome.status, &outcome, Some(response))
                    .await?
                else {
                    return Ok(false);
                };
                if is_abort {
                    self.interrupts
                        .register(InterruptRequest::new(
                            InterruptType::AbortAll,
                            done.plan_execution_id(),
                            IssuedBy::Adviser { adviser_type },
                        ))
                        .await?;
                    return Ok(true);
                }
                let errored = self
                    .nodes
                    .error_out_active_nodes(done.plan_execution_id())
                    .await?;
                log::info!(
                    "Ending plan execution {} after node {}, errored {} active nodes",
                    done.plan_execution_id(),
                    done.uuid,
                    errored
                );
                self.end_plan(done.plan_execution_id(), done.status, done.failure_info.clone())
                    .await
            }
        }
    }

    async fn finalize(
        &self,
        id: &str,
        to: Status,
        outcome: &StepOutcome,
        adviser_response: Option<AdviserResponse>,
    ) -> Result<Option<NodeExecution>> {
        self.set_status(id, to, |n| {
            n.failure_info = outcome.failure_info.clone();
            n.outcomes = outcome.outcomes.clone();
            n.adviser_response = adviser_response.clone();
        })
        .await
    }

    /// Queue `next_node_id` as the next node of `done`'s chain, or conclude
    /// the chain.
    async fn continue_or_conclude(
        &self,
        done: &NodeExecution,
        next_node_id: Option<String>,
    ) -> Result<bool> {
        let Some(next_node_id) = next_node_id else {
            return self.conclude(done).await;
        };
        let (plan, _) = self.plan_node_of(done)?;
        let next = self.prepare_node(
            &done.ambiance.clone_for_finish(),
            plan.node(&next_node_id)?,
            NodeLinks::after(done),
        );
        log::debug!(
            "Node {} ({}) done, next is {} ({})",
            done.uuid,
            done.identifier,
            next.uuid,
            next.identifier
        );
        self.queue_node(next, 0).await?;
        Ok(true)
    }

    /// Finish `node` as superseded and queue a fresh attempt in its place.
    pub(super) async fn retry_node(
        &self,
        node: &NodeExecution,
        outcome: &StepOutcome,
        adviser_response: Option<AdviserResponse>,
        delay_ms: u64,
        effect: Option<InterruptEffect>,
    ) -> Result<bool> {
        let to = if outcome.status.is_final() {
            outcome.status
        } else {
            Status::Failed
        };
        let Some(old) = self
            .set_status(&node.uuid, to, |n| {
                n.failure_info = outcome.failure_info.clone();
                n.outcomes = outcome.outcomes.clone();
                n.adviser_response = adviser_response.clone();
                n.old_retry = true;
                if let Some(effect) = &effect {
                    n.interrupt_histories.push(effect.clone());
                }
            })
            .await?
        else {
            return Ok(false);
        };
        self.timeouts.cancel_for_node(&old.uuid);

        let (plan, _) = self.plan_node_of(&old)?;
        let retry = self.prepare_node(
            &old.ambiance.clone_for_finish(),
            plan.node(&old.plan_node_id)?,
            NodeLinks::retry_of(&old),
        );
        log::info!(
            "Retrying node {} ({}) as {}, attempt {}",
            old.uuid,
            old.identifier,
            retry.uuid,
            retry.retry_ids.len() + 1
        );
        self.queue_node(retry, delay_ms).await?;
        Ok(true)
    }
}
