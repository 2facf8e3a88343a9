//! Interrupts: asynchronous control signals against a plan or node
//!
//! An interrupt is registered, persisted and published; it is never applied
//! inline. The engine's interrupt listener picks it up, resolves the target
//! and applies it exactly once. A target that already finished drops the
//! interrupt as `DISCARDED`.

mod manager;
mod store;
mod timeout;

pub use manager::{InterruptManager, InterruptRequest};
pub use store::{InMemoryInterruptStore, InterruptStore};
pub use timeout::{TimeoutHandle, TimeoutScheduler};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::advise::RepairActionCode;
use crate::error::EngineError;
use crate::persistence::Versioned;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    Abort,
    AbortAll,
    Pause,
    Resume,
    Retry,
    MarkSuccess,
    MarkFailed,
    Ignore,
}

impl InterruptType {
    /// Types that act on the whole plan when no node is given.
    pub fn is_plan_level(self) -> bool {
        matches!(
            self,
            InterruptType::AbortAll | InterruptType::Pause | InterruptType::Resume
        )
    }

    /// Types that need a target node.
    pub fn requires_node(self) -> bool {
        !self.is_plan_level()
    }

    /// Interrupt issued when a manual intervention times out. Pipeline
    /// rollback expires as a failure once the rollback flag is set.
    pub fn for_repair_action(code: RepairActionCode) -> Option<Self> {
        match code {
            RepairActionCode::Retry => Some(InterruptType::Retry),
            RepairActionCode::Ignore => Some(InterruptType::Ignore),
            RepairActionCode::MarkAsSuccess => Some(InterruptType::MarkSuccess),
            RepairActionCode::MarkAsFailure | RepairActionCode::PipelineRollback => {
                Some(InterruptType::MarkFailed)
            }
            RepairActionCode::Abort => Some(InterruptType::Abort),
            RepairActionCode::EndExecution => Some(InterruptType::AbortAll),
            RepairActionCode::ManualIntervention => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InterruptType::Abort => "ABORT",
            InterruptType::AbortAll => "ABORT_ALL",
            InterruptType::Pause => "PAUSE",
            InterruptType::Resume => "RESUME",
            InterruptType::Retry => "RETRY",
            InterruptType::MarkSuccess => "MARK_SUCCESS",
            InterruptType::MarkFailed => "MARK_FAILED",
            InterruptType::Ignore => "IGNORE",
        }
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterruptType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ABORT" => Ok(InterruptType::Abort),
            "ABORT_ALL" => Ok(InterruptType::AbortAll),
            "PAUSE" => Ok(InterruptType::Pause),
            "RESUME" => Ok(InterruptType::Resume),
            "RETRY" => Ok(InterruptType::Retry),
            "MARK_SUCCESS" => Ok(InterruptType::MarkSuccess),
            "MARK_FAILED" => Ok(InterruptType::MarkFailed),
            "IGNORE" => Ok(InterruptType::Ignore),
            other => Err(EngineError::invalid(format!("unknown interrupt type '{}'", other))),
        }
    }
}

/// Who raised the interrupt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IssuedBy {
    #[serde(rename_all = "camelCase")]
    Manual { user: String },
    /// Raised by an expired manual intervention
    #[serde(rename_all = "camelCase")]
    Timeout { timeout_instance_id: String },
    #[serde(rename_all = "camelCase")]
    Adviser { adviser_type: String },
    System,
}

impl IssuedBy {
    pub fn manual(user: impl Into<String>) -> Self {
        IssuedBy::Manual { user: user.into() }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, IssuedBy::Timeout { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    Processed,
    Discarded,
}

impl InterruptState {
    pub fn is_active(self) -> bool {
        matches!(self, InterruptState::Registered | InterruptState::Processing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interrupt {
    pub uuid: String,
    pub interrupt_type: InterruptType,
    pub plan_execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<String>,
    pub issued_by: IssuedBy,
    pub state: InterruptState,
    pub created_at: i64,
    #[serde(default)]
    pub version: u64,
}

impl Versioned for Interrupt {
    const KIND: &'static str = "Interrupt";

    fn id(&self) -> &str {
        &self.uuid
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Entry in a node's interrupt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptEffect {
    pub interrupt_id: String,
    pub interrupt_type: InterruptType,
    pub issued_by: IssuedBy,
    pub took_effect_at: i64,
}

impl InterruptEffect {
    pub fn of(interrupt: &Interrupt) -> Self {
        Self {
            interrupt_id: interrupt.uuid.clone(),
            interrupt_type: interrupt.interrupt_type,
            issued_by: interrupt.issued_by.clone(),
            took_effect_at: crate::now_millis(),
        }
    }
}
