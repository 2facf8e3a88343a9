//! Fork step: runs child nodes in parallel and folds their outcomes

use async_trait::async_trait;
use pipeline_contracts::{FailureInfo, Status};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::executable::{
    ChildrenExecutable, ChildrenRequest, RollbackOutcome, StepContext, StepResponse,
    ROLLBACK_OUTCOME,
};
use crate::waiter::ResponseMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkStepParameters {
    pub child_node_ids: Vec<String>,
}

/// Fans out to parallel branches and aggregates them.
///
/// The aggregate is `FAILED` as soon as one branch broke and `SUCCEEDED`
/// otherwise. Failure infos of broken branches are merged. Each branch's
/// rollback outcome is copied under `rollbackOutcome.<child runtime id>`.
pub struct ForkStep;

#[async_trait]
impl ChildrenExecutable for ForkStep {
    async fn obtain_children(&self, ctx: &StepContext) -> Result<ChildrenRequest> {
        let params: ForkStepParameters = ctx.parameters_as()?;
        if params.child_node_ids.is_empty() {
            return Err(EngineError::invalid(format!(
                "fork '{}' has no branches",
                ctx.identifier()
            )));
        }
        Ok(ChildrenRequest {
            child_node_ids: params.child_node_ids,
        })
    }

    async fn handle_children_response(
        &self,
        _ctx: &StepContext,
        responses: &ResponseMap,
    ) -> Result<StepResponse> {
        let mut failure: Option<FailureInfo> = None;
        for response in responses.values().filter(|r| r.status.is_broke()) {
            let merged = failure.get_or_insert_with(|| FailureInfo::new(""));
            match &response.failure_info {
                Some(info) => merged.merge(info),
                None => merged.merge(&FailureInfo::new(format!(
                    "branch {} ended {}",
                    response.identifier.as_deref().unwrap_or("?"),
                    response.status
                ))),
            }
        }

        let mut aggregate = match failure {
            Some(info) => StepResponse::failed(info),
            None => StepResponse::with_status(Status::Succeeded),
        };
        for (child_id, response) in responses {
            if let Some(rollback) = RollbackOutcome::from_outcomes(&response.outcomes) {
                let tag = response
                    .identifier
                    .as_deref()
                    .unwrap_or(&rollback.identifier)
                    .to_string();
                aggregate = aggregate.with_outcome(
                    format!("{}.{}", ROLLBACK_OUTCOME, child_id),
                    rollback.retagged(&tag).to_value(),
                );
            }
        }
        Ok(aggregate)
    }
}
