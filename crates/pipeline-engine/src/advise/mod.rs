//! Adviser chain
//!
//! When a node reaches a terminal status the engine asks the node's advisers,
//! in authoring order, what happens next. The first adviser whose
//! `can_advise` returns true decides; the rest are not consulted.
//!
//! Advisers are looked up by type tag in [`ADVISER_TABLE`], a static table
//! of constructors. Parameters arrive as codec-encoded bytes.

mod advisers;
mod manual_intervention;
mod rollback;

pub use advisers::{
    AbortAdviser, IgnoreAdviser, MarkSuccessAdviser, NextNodeParameters, NextStepAdviser,
    OnFailAdviser, OnSuccessAdviser, RetryAdviser, RetryParameters,
};
pub use manual_intervention::{ManualInterventionParameters, ManualInterventionWithRollbackAdviser};
pub use rollback::{OnFailPipelineRollbackAdviser, PipelineRollbackParameters};

use std::collections::BTreeSet;
use std::sync::Arc;

use pipeline_contracts::{Ambiance, FailureInfo, FailureType, Status};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{self, Codec};
use crate::error::{EngineError, Result};
use crate::outputs::SweepingOutputStore;
use crate::plan::AdviserObtainment;

/// Adviser type tags
pub mod adviser_types {
    pub const ON_SUCCESS: &str = "ON_SUCCESS";
    pub const NEXT_STEP: &str = "NEXT_STEP";
    pub const ON_FAIL: &str = "ON_FAIL";
    pub const RETRY: &str = "RETRY";
    pub const MANUAL_INTERVENTION_WITH_ROLLBACK: &str = "MANUAL_INTERVENTION_WITH_ROLLBACK";
    pub const ON_FAIL_PIPELINE_ROLLBACK: &str = "ON_FAIL_PIPELINE_ROLLBACK";
    pub const IGNORE: &str = "IGNORE";
    pub const ABORT: &str = "ABORT";
    pub const MARK_SUCCESS: &str = "MARK_SUCCESS";
}

/// Action taken on a failure, immediately or when an intervention expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairActionCode {
    ManualIntervention,
    Retry,
    Ignore,
    MarkAsSuccess,
    MarkAsFailure,
    Abort,
    EndExecution,
    PipelineRollback,
}

/// What the engine knows when it asks for advice.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvisingEvent {
    pub ambiance: Ambiance,
    pub node_execution_id: String,
    /// Status the node is about to take
    pub to_status: Status,
    /// Status the node had before
    pub from_status: Status,
    pub failure_info: Option<FailureInfo>,
    pub retry_ids: Vec<String>,
    /// The previous wait on this node ended through a timeout interrupt
    pub previous_adviser_expired: bool,
}

impl AdvisingEvent {
    pub fn retry_count(&self) -> usize {
        self.retry_ids.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AdviserResponse {
    /// Continue with `next_node_id`, or conclude the node when absent
    #[serde(rename_all = "camelCase")]
    NextStep { next_node_id: Option<String> },
    #[serde(rename_all = "camelCase")]
    Retry { wait_interval_ms: u64 },
    #[serde(rename_all = "camelCase")]
    InterventionWait {
        timeout_ms: u64,
        repair_action_code: RepairActionCode,
        next_node_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MarkSuccess { next_node_id: Option<String> },
    #[serde(rename_all = "camelCase")]
    Ignore { next_node_id: Option<String> },
    #[serde(rename_all = "camelCase")]
    EndPlan { is_abort: bool },
}

pub trait Adviser: Send + Sync {
    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool>;

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<AdviserResponse>;
}

/// Collaborators available to adviser constructors.
#[derive(Clone)]
pub struct AdviserContext {
    pub codec: Arc<dyn Codec>,
    pub outputs: Arc<SweepingOutputStore>,
    pub default_intervention_timeout_ms: u64,
}

pub type AdviserConstructor = fn(&AdviserContext, &[u8]) -> Result<Box<dyn Adviser>>;

pub struct AdviserRegistration {
    pub adviser_type: &'static str,
    pub construct: AdviserConstructor,
}

/// Every adviser the engine knows, keyed by type tag.
pub static ADVISER_TABLE: &[AdviserRegistration] = &[
    AdviserRegistration {
        adviser_type: adviser_types::ON_SUCCESS,
        construct: OnSuccessAdviser::construct,
    },
    AdviserRegistration {
        adviser_type: adviser_types::NEXT_STEP,
        construct: NextStepAdviser::construct,
    },
    AdviserRegistration {
        adviser_type: adviser_types::ON_FAIL,
        construct: OnFailAdviser::construct,
    },
    AdviserRegistration {
        adviser_type: adviser_types::RETRY,
        construct: RetryAdviser::construct,
    },
    AdviserRegistration {
        adviser_type: adviser_types::MANUAL_INTERVENTION_WITH_ROLLBACK,
        construct: ManualInterventionWithRollbackAdviser::construct,
    },
    AdviserRegistration {
        adviser_type: adviser_types::ON_FAIL_PIPELINE_ROLLBACK,
        construct: OnFailPipelineRollbackAdviser::construct,
    },
    AdviserRegistration {
        adviser_type: adviser_types::IGNORE,
        construct: IgnoreAdviser::construct,
    },
    AdviserRegistration {
        adviser_type: adviser_types::ABORT,
        construct: AbortAdviser::construct,
    },
    AdviserRegistration {
        adviser_type: adviser_types::MARK_SUCCESS,
        construct: MarkSuccessAdviser::construct,
    },
];

pub fn lookup_adviser(adviser_type: &str) -> Result<AdviserConstructor> {
    ADVISER_TABLE
        .iter()
        .find(|r| r.adviser_type == adviser_type)
        .map(|r| r.construct)
        .ok_or_else(|| EngineError::invalid(format!("unknown adviser type '{}'", adviser_type)))
}

/// Decode adviser parameters; empty bytes mean defaults.
pub(crate) fn decode_parameters<T: DeserializeOwned + Default>(
    ctx: &AdviserContext,
    adviser_type: &str,
    bytes: &[u8],
) -> Result<T> {
    if bytes.is_empty() {
        return Ok(T::default());
    }
    codec::decode(ctx.codec.as_ref(), adviser_type, bytes)
}

/// An empty applicable set matches every failure. Otherwise the node must
/// carry at least one of the applicable types.
pub fn failure_types_match(
    applicable: &BTreeSet<FailureType>,
    failure_info: Option<&FailureInfo>,
) -> bool {
    if applicable.is_empty() {
        return true;
    }
    failure_info.is_some_and(|info| !applicable.is_disjoint(&info.all_failure_types()))
}

/// First-match evaluation of a node's adviser obtainments.
pub struct AdviseChain {
    ctx: AdviserContext,
}

impl AdviseChain {
    pub fn new(ctx: AdviserContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &AdviserContext {
        &self.ctx
    }

    /// Returns the winning adviser's tag and response, or `None` when no
    /// adviser applies.
    pub fn advise(
        &self,
        obtainments: &[AdviserObtainment],
        event: &AdvisingEvent,
    ) -> Result<Option<(String, AdviserResponse)>> {
        for obtainment in obtainments {
            let construct = lookup_adviser(&obtainment.adviser_type)?;
            let adviser = construct(&self.ctx, &obtainment.parameters)?;
            if adviser.can_advise(event)? {
                let response = adviser.on_advise_event(event)?;
                log::debug!(
                    "Adviser {} advised {:?} for node {} ({} -> {})",
                    obtainment.adviser_type,
                    response,
                    event.node_execution_id,
                    event.from_status,
                    event.to_status
                );
                return Ok(Some((obtainment.adviser_type.clone(), response)));
            }
        }
        Ok(None)
    }
}
