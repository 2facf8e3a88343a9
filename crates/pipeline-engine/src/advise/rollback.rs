//! On-fail pipeline rollback
//!
//! Records the pipeline-scoped `usePipelineRollbackStrategy` flag and lets
//! the node conclude. The engine sees the flag when the plan finishes and
//! runs the plan's rollback section instead of ending.

use std::collections::BTreeSet;
use std::sync::Arc;

use pipeline_contracts::FailureType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    adviser_types, decode_parameters, failure_types_match, Adviser, AdviserContext,
    AdviserResponse, AdvisingEvent,
};
use crate::error::Result;
use crate::outputs::{OutputScope, SweepingOutputStore, USE_PIPELINE_ROLLBACK_STRATEGY};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineRollbackParameters {
    pub applicable_failure_types: BTreeSet<FailureType>,
}

pub struct OnFailPipelineRollbackAdviser {
    params: PipelineRollbackParameters,
    outputs: Arc<SweepingOutputStore>,
}

impl OnFailPipelineRollbackAdviser {
    pub fn construct(ctx: &AdviserContext, bytes: &[u8]) -> Result<Box<dyn Adviser>> {
        let params = decode_parameters(ctx, adviser_types::ON_FAIL_PIPELINE_ROLLBACK, bytes)?;
        Ok(Box::new(Self {
            params,
            outputs: ctx.outputs.clone(),
        }))
    }
}

impl Adviser for OnFailPipelineRollbackAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(event.to_status.is_broke()
            && failure_types_match(
                &self.params.applicable_failure_types,
                event.failure_info.as_ref(),
            ))
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<AdviserResponse> {
        self.outputs.consume(
            &event.ambiance,
            USE_PIPELINE_ROLLBACK_STRATEGY,
            Value::Bool(true),
            OutputScope::Pipeline,
        )?;
        Ok(AdviserResponse::NextStep { next_node_id: None })
    }
}
