//! Section step: runs a single child node and takes on its outcome

use async_trait::async_trait;
use pipeline_contracts::Status;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::executable::{
    ChildExecutable, ChildRequest, RollbackOutcome, StepContext, StepResponse, ROLLBACK_OUTCOME,
};
use crate::waiter::ResponseMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionStepParameters {
    pub child_node_id: String,
}

/// Runs one child chain: a stage, a step group or the steps of a pipeline.
/// Reports the child's status as its own.
pub struct SectionStep;

#[async_trait]
impl ChildExecutable for SectionStep {
    async fn obtain_child(&self, ctx: &StepContext) -> Result<ChildRequest> {
        let params: SectionStepParameters = ctx.parameters_as()?;
        Ok(ChildRequest {
            child_node_id: params.child_node_id,
        })
    }

    async fn handle_child_response(
        &self,
        ctx: &StepContext,
        responses: &ResponseMap,
    ) -> Result<StepResponse> {
        let child = responses.values().next().ok_or_else(|| {
            EngineError::invalid(format!("section {} resumed without a child response", ctx.node_execution_id))
        })?;

        let status = if child.status.is_positive() {
            Status::Succeeded
        } else {
            child.status
        };
        let mut response = StepResponse::with_status(status);
        response.failure_info = child.failure_info.clone();
        if let Some(rollback) = RollbackOutcome::from_outcomes(&child.outcomes) {
            response = response.with_outcome(
                ROLLBACK_OUTCOME,
                rollback.retagged(ctx.identifier()).to_value(),
            );
        }
        Ok(response)
    }
}
