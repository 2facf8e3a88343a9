//! Pipeline Contracts - shared vocabulary of the pipeline engine
//!
//! Leaf crate holding the value types every other component reads:
//!
//! - [`Ambiance`] / [`Level`]: immutable root-to-current execution path
//! - [`Status`]: node execution state machine
//! - [`StepType`] / [`FacilitatorType`]: what a plan node is and how it runs
//! - [`FailureInfo`]: failure causes consumed by advisers

pub mod ambiance;
pub mod error;
pub mod failure;
pub mod status;
pub mod step;

pub use ambiance::{Ambiance, Level};
pub use error::{ContractError, Result};
pub use failure::{FailureData, FailureInfo, FailureType};
pub use status::Status;
pub use step::{groups, step_types, FacilitatorType, StepCategory, StepType};
