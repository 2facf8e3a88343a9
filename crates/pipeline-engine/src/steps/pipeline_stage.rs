//! Pipeline stage step: launches a chained plan and waits for it

use async_trait::async_trait;
use pipeline_contracts::Status;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::executable::{
    AsyncExecutable, AsyncExecutableResponse, ChildPlanRequest, StepContext, StepResponse,
};
use crate::waiter::ResponseMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStageParameters {
    /// Plan to chain
    pub plan_id: String,
}

/// Launches a chained child pipeline and waits for it to finish. The child
/// plan execution id is the callback id.
pub struct PipelineStageStep;

#[async_trait]
impl AsyncExecutable for PipelineStageStep {
    async fn execute_async(&self, ctx: &StepContext) -> Result<AsyncExecutableResponse> {
        let params: PipelineStageParameters = ctx.parameters_as()?;
        let plan_execution_id = uuid::Uuid::new_v4().to_string();
        log::info!(
            "Pipeline stage {} chaining plan '{}' as {}",
            ctx.node_execution_id,
            params.plan_id,
            plan_execution_id
        );
        Ok(AsyncExecutableResponse {
            callback_ids: vec![plan_execution_id.clone()],
            child_plans: vec![ChildPlanRequest {
                plan_id: params.plan_id,
                plan_execution_id,
            }],
        })
    }

    async fn handle_async_response(
        &self,
        ctx: &StepContext,
        responses: &ResponseMap,
    ) -> Result<StepResponse> {
        let child = responses.values().next().ok_or_else(|| {
            EngineError::invalid(format!(
                "pipeline stage {} resumed without a child plan result",
                ctx.node_execution_id
            ))
        })?;
        let status = if child.status.is_positive() {
            Status::Succeeded
        } else {
            child.status
        };
        let mut response = StepResponse::with_status(status);
        response.failure_info = child.failure_info.clone();
        Ok(response)
    }
}
