//! Flow advisers: success chaining, failure branching, retry and the
//! single-action failure strategies.

use std::collections::BTreeSet;

use pipeline_contracts::{FailureType, Status};
use serde::{Deserialize, Serialize};

use super::{
    adviser_types, decode_parameters, failure_types_match, Adviser, AdviserContext,
    AdviserResponse, AdvisingEvent, RepairActionCode,
};
use crate::error::Result;

/// Parameters shared by every adviser that only names a follow-up node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NextNodeParameters {
    pub next_node_id: Option<String>,
    pub applicable_failure_types: BTreeSet<FailureType>,
}

/// Chains to the next node after a positive outcome.
pub struct OnSuccessAdviser {
    params: NextNodeParameters,
}

impl OnSuccessAdviser {
    pub fn construct(ctx: &AdviserContext, bytes: &[u8]) -> Result<Box<dyn Adviser>> {
        let params = decode_parameters(ctx, adviser_types::ON_SUCCESS, bytes)?;
        Ok(Box::new(Self { params }))
    }
}

impl Adviser for OnSuccessAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(event.to_status.is_positive())
    }

    fn on_advise_event(&self, _event: &AdvisingEvent) -> Result<AdviserResponse> {
        Ok(AdviserResponse::NextStep {
            next_node_id: self.params.next_node_id.clone(),
        })
    }
}

/// Moves on whatever the outcome, except after an abort.
pub struct NextStepAdviser {
    params: NextNodeParameters,
}

impl NextStepAdviser {
    pub fn construct(ctx: &AdviserContext, bytes: &[u8]) -> Result<Box<dyn Adviser>> {
        let params = decode_parameters(ctx, adviser_types::NEXT_STEP, bytes)?;
        Ok(Box::new(Self { params }))
    }
}

impl Adviser for NextStepAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(event.to_status.is_final() && event.to_status != Status::Aborted)
    }

    fn on_advise_event(&self, _event: &AdvisingEvent) -> Result<AdviserResponse> {
        Ok(AdviserResponse::NextStep {
            next_node_id: self.params.next_node_id.clone(),
        })
    }
}

/// Branches to a failure path when the failure types match.
pub struct OnFailAdviser {
    params: NextNodeParameters,
}

impl OnFailAdviser {
    pub fn construct(ctx: &AdviserContext, bytes: &[u8]) -> Result<Box<dyn Adviser>> {
        let params = decode_parameters(ctx, adviser_types::ON_FAIL, bytes)?;
        Ok(Box::new(Self { params }))
    }
}

impl Adviser for OnFailAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(event.to_status.is_broke()
            && failure_types_match(
                &self.params.applicable_failure_types,
                event.failure_info.as_ref(),
            ))
    }

    fn on_advise_event(&self, _event: &AdvisingEvent) -> Result<AdviserResponse> {
        Ok(AdviserResponse::NextStep {
            next_node_id: self.params.next_node_id.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryParameters {
    pub retry_count: u32,
    /// Wait before each retry; the last entry repeats
    pub wait_intervals_ms: Vec<u64>,
    pub applicable_failure_types: BTreeSet<FailureType>,
    /// What to do once retries are exhausted
    pub repair_action_code_after_retry: RepairActionCode,
    pub next_node_id: Option<String>,
}

impl Default for RetryParameters {
    fn default() -> Self {
        Self {
            retry_count: 1,
            wait_intervals_ms: Vec::new(),
            applicable_failure_types: BTreeSet::new(),
            repair_action_code_after_retry: RepairActionCode::MarkAsFailure,
            next_node_id: None,
        }
    }
}

/// Re-runs a failed node a bounded number of times.
pub struct RetryAdviser {
    params: RetryParameters,
    default_intervention_timeout_ms: u64,
}

impl RetryAdviser {
    pub fn construct(ctx: &AdviserContext, bytes: &[u8]) -> Result<Box<dyn Adviser>> {
        let params = decode_parameters(ctx, adviser_types::RETRY, bytes)?;
        Ok(Box::new(Self {
            params,
            default_intervention_timeout_ms: ctx.default_intervention_timeout_ms,
        }))
    }

    fn wait_interval(&self, retry_index: usize) -> u64 {
        let intervals = &self.params.wait_intervals_ms;
        intervals
            .get(retry_index)
            .or_else(|| intervals.last())
            .copied()
            .unwrap_or(0)
    }

    fn after_retries(&self, event: &AdvisingEvent) -> AdviserResponse {
        let next_node_id = self.params.next_node_id.clone();
        match self.params.repair_action_code_after_retry {
            // An intervention that was already resolved or timed out is not reopened.
            RepairActionCode::ManualIntervention
                if event.from_status == Status::InterventionWaiting
                    || event.previous_adviser_expired =>
            {
                AdviserResponse::NextStep { next_node_id: None }
            }
            RepairActionCode::ManualIntervention => AdviserResponse::InterventionWait {
                timeout_ms: self.default_intervention_timeout_ms,
                repair_action_code: RepairActionCode::MarkAsFailure,
                next_node_id,
            },
            RepairActionCode::Ignore => AdviserResponse::Ignore { next_node_id },
            RepairActionCode::MarkAsSuccess => AdviserResponse::MarkSuccess { next_node_id },
            RepairActionCode::Abort => AdviserResponse::EndPlan { is_abort: true },
            RepairActionCode::EndExecution => AdviserResponse::EndPlan { is_abort: false },
            RepairActionCode::MarkAsFailure
            | RepairActionCode::Retry
            | RepairActionCode::PipelineRollback => AdviserResponse::NextStep { next_node_id: None },
        }
    }
}

impl Adviser for RetryAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(event.to_status.is_broke()
            && event.to_status != Status::Aborted
            && failure_types_match(
                &self.params.applicable_failure_types,
                event.failure_info.as_ref(),
            ))
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<AdviserResponse> {
        let attempts = event.retry_count();
        if attempts < self.params.retry_count as usize {
            return Ok(AdviserResponse::Retry {
                wait_interval_ms: self.wait_interval(attempts),
            });
        }
        log::info!(
            "Node {} exhausted {} retries, applying {:?}",
            event.node_execution_id,
            self.params.retry_count,
            self.params.repair_action_code_after_retry
        );
        Ok(self.after_retries(event))
    }
}

/// Ignores a matching failure and continues.
pub struct IgnoreAdviser {
    params: NextNodeParameters,
}

impl IgnoreAdviser {
    pub fn construct(ctx: &AdviserContext, bytes: &[u8]) -> Result<Box<dyn Adviser>> {
        let params = decode_parameters(ctx, adviser_types::IGNORE, bytes)?;
        Ok(Box::new(Self { params }))
    }
}

impl Adviser for IgnoreAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(event.to_status.is_broke()
            && failure_types_match(
                &self.params.applicable_failure_types,
                event.failure_info.as_ref(),
            ))
    }

    fn on_advise_event(&self, _event: &AdvisingEvent) -> Result<AdviserResponse> {
        Ok(AdviserResponse::Ignore {
            next_node_id: self.params.next_node_id.clone(),
        })
    }
}

/// Marks a matching failure as success and continues.
pub struct MarkSuccessAdviser {
    params: NextNodeParameters,
}

impl MarkSuccessAdviser {
    pub fn construct(ctx: &AdviserContext, bytes: &[u8]) -> Result<Box<dyn Adviser>> {
        let params = decode_parameters(ctx, adviser_types::MARK_SUCCESS, bytes)?;
        Ok(Box::new(Self { params }))
    }
}

impl Adviser for MarkSuccessAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(event.to_status.is_broke()
            && failure_types_match(
                &self.params.applicable_failure_types,
                event.failure_info.as_ref(),
            ))
    }

    fn on_advise_event(&self, _event: &AdvisingEvent) -> Result<AdviserResponse> {
        Ok(AdviserResponse::MarkSuccess {
            next_node_id: self.params.next_node_id.clone(),
        })
    }
}

/// Ends the whole plan as aborted on a matching failure.
pub struct AbortAdviser {
    params: NextNodeParameters,
}

impl AbortAdviser {
    pub fn construct(ctx: &AdviserContext, bytes: &[u8]) -> Result<Box<dyn Adviser>> {
        let params = decode_parameters(ctx, adviser_types::ABORT, bytes)?;
        Ok(Box::new(Self { params }))
    }
}

impl Adviser for AbortAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(event.to_status.is_broke()
            && failure_types_match(
                &self.params.applicable_failure_types,
                event.failure_info.as_ref(),
            ))
    }

    fn on_advise_event(&self, _event: &AdvisingEvent) -> Result<AdviserResponse> {
        Ok(AdviserResponse::EndPlan { is_abort: true })
    }
}
