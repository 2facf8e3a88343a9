//! Manual intervention with rollback
//!
//! Parks a broken node in `INTERVENTION_WAITING` until an operator resolves
//! it, or until the timeout fires and the configured repair action is issued
//! as a timeout interrupt. It never advises a node that is coming out of an
//! intervention, and never advises again after its own wait expired, so a
//! node cannot loop back into the same wait.

use std::collections::BTreeSet;

use pipeline_contracts::{FailureType, Status};
use serde::{Deserialize, Serialize};

use super::{
    adviser_types, decode_parameters, failure_types_match, Adviser, AdviserContext,
    AdviserResponse, AdvisingEvent, RepairActionCode,
};
use crate::error::{EngineError, Result};
use crate::interrupt::InterruptType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManualInterventionParameters {
    pub applicable_failure_types: BTreeSet<FailureType>,
    /// Falls back to the engine default (24h) when unset
    pub timeout_ms: Option<u64>,
    pub timeout_action: RepairActionCode,
    /// Continuation used when the timeout action ignores or marks success
    pub next_node_id: Option<String>,
}

impl Default for ManualInterventionParameters {
    fn default() -> Self {
        Self {
            applicable_failure_types: BTreeSet::new(),
            timeout_ms: None,
            timeout_action: RepairActionCode::Abort,
            next_node_id: None,
        }
    }
}

pub struct ManualInterventionWithRollbackAdviser {
    params: ManualInterventionParameters,
    default_timeout_ms: u64,
}

impl ManualInterventionWithRollbackAdviser {
    pub fn construct(ctx: &AdviserContext, bytes: &[u8]) -> Result<Box<dyn Adviser>> {
        let params: ManualInterventionParameters =
            decode_parameters(ctx, adviser_types::MANUAL_INTERVENTION_WITH_ROLLBACK, bytes)?;
        if InterruptType::for_repair_action(params.timeout_action).is_none() {
            return Err(EngineError::invalid(format!(
                "{:?} cannot be a manual intervention timeout action",
                params.timeout_action
            )));
        }
        Ok(Box::new(Self {
            params,
            default_timeout_ms: ctx.default_intervention_timeout_ms,
        }))
    }
}

impl Adviser for ManualInterventionWithRollbackAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        if event.from_status == Status::InterventionWaiting || event.previous_adviser_expired {
            return Ok(false);
        }
        Ok(event.to_status.is_broke()
            && failure_types_match(
                &self.params.applicable_failure_types,
                event.failure_info.as_ref(),
            ))
    }

    fn on_advise_event(&self, _event: &AdvisingEvent) -> Result<AdviserResponse> {
        Ok(AdviserResponse::InterventionWait {
            timeout_ms: self.params.timeout_ms.unwrap_or(self.default_timeout_ms),
            repair_action_code: self.params.timeout_action,
            next_node_id: self.params.next_node_id.clone(),
        })
    }
}
