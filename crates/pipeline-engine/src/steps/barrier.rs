//! Barrier step: waits until every position of its barrier is reached

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::executable::{AsyncExecutable, AsyncExecutableResponse, StepContext, StepResponse};
use crate::waiter::ResponseMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarrierStepParameters {
    /// Identifier of the barrier to wait on
    pub barrier_ref: String,
}

/// Parks in `ASYNC_WAITING` on its own runtime id until the barrier it
/// references goes down.
pub struct BarrierStep;

#[async_trait]
impl AsyncExecutable for BarrierStep {
    async fn execute_async(&self, ctx: &StepContext) -> Result<AsyncExecutableResponse> {
        let params: BarrierStepParameters = ctx.parameters_as()?;
        log::debug!(
            "Node {} waiting on barrier '{}'",
            ctx.node_execution_id,
            params.barrier_ref
        );
        Ok(AsyncExecutableResponse::waiting_on(ctx.node_execution_id.clone()))
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        responses: &ResponseMap,
    ) -> Result<StepResponse> {
        Ok(match responses.values().find(|r| r.status.is_broke()) {
            Some(broke) => {
                let mut response = StepResponse::with_status(broke.status);
                response.failure_info = broke.failure_info.clone();
                response
            }
            None => StepResponse::succeeded(),
        })
    }
}
