//! Pipeline Engine - event-driven orchestration of pipeline plans
//!
//! This crate executes plans (graphs of plan nodes) as trees of node
//! executions. It supports:
//!
//! - Five execution contracts: sync, async, child, children and task
//! - Advisers deciding what follows a finished node (next step, retry,
//!   manual intervention, ignore, abort, pipeline rollback)
//! - Interrupts (abort, pause, resume, retry, mark success/failed, ignore)
//!   including timeout issued repair actions
//! - Barriers synchronising parallel stages, step groups and steps
//! - Chained child pipelines with abort cascading
//!
//! # Architecture
//!
//! All state lives in versioned records updated optimistically:
//!
//! - `NodeExecution` / `PlanExecution`: runtime records, see [`execution`]
//! - `Interrupt`: requests to change a running plan, see [`interrupt`]
//! - `BarrierExecutionInstance`: barrier positions, see [`barrier`]
//!
//! The [`engine::OrchestrationEngine`] reacts to messages published on the
//! in-process bus in [`events`]; [`engine::OrchestrationRuntime`] wires
//! the engine to one consumer per topic.
//!
//! # Example
//!
//! ```ignore
//! use pipeline_engine::{EngineConfig, OrchestrationRuntime, PlanBuilder};
//!
//! let runtime = OrchestrationRuntime::start(EngineConfig::default())?;
//! runtime.engine().register_plan(plan)?;
//! let pe = runtime.engine().start_plan("deploy", Default::default()).await?;
//! let done = runtime.wait_for_plan(&pe.uuid, Duration::from_secs(5)).await?;
//! ```

pub mod advise;
pub mod barrier;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executable;
pub mod execution;
pub mod interrupt;
pub mod outputs;
pub mod persistence;
pub mod plan;
pub mod steps;
pub mod task;
pub mod waiter;

// Re-export key types
pub use advise::{AdviserResponse, RepairActionCode};
pub use config::EngineConfig;
pub use engine::{EngineBuilder, OrchestrationEngine, OrchestrationRuntime};
pub use error::{EngineError, Result};
pub use executable::{Executable, StepContext, StepResponse};
pub use execution::{NodeExecution, PlanExecution};
pub use interrupt::{InterruptRequest, InterruptType, IssuedBy};
pub use plan::{Plan, PlanBuilder};
pub use waiter::NotifyResponse;

// Re-export the shared vocabulary
pub use pipeline_contracts::{Ambiance, FailureInfo, FailureType, Level, Status, StepType};

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
