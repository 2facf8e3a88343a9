//! Built-in steps and facilitation
//!
//! Step implementations are registered by type name in a [`StepRegistry`].
//! The [`Facilitator`] resolves a plan node to its executable and checks
//! that the contract it implements is the one the node declares.

mod barrier;
mod fork;
mod pipeline_stage;
mod section;

pub use barrier::{BarrierStep, BarrierStepParameters};
pub use fork::{ForkStep, ForkStepParameters};
pub use pipeline_stage::{PipelineStageParameters, PipelineStageStep};
pub use section::{SectionStep, SectionStepParameters};

use std::collections::HashMap;
use std::sync::Arc;

use pipeline_contracts::step_types;

use crate::error::{EngineError, Result};
use crate::executable::Executable;
use crate::plan::PlanNode;

/// Built-in steps available in every registry.
pub static BUILTIN_STEPS: &[(&str, fn() -> Executable)] = &[
    (step_types::SECTION, || Executable::Child(Arc::new(SectionStep))),
    (step_types::FORK, || Executable::Children(Arc::new(ForkStep))),
    (step_types::BARRIER, || Executable::Async(Arc::new(BarrierStep))),
    (step_types::PIPELINE_STAGE, || {
        Executable::Async(Arc::new(PipelineStageStep))
    }),
];

/// Step type name to executable.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Executable>,
}

impl StepRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in steps
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (type_name, build) in BUILTIN_STEPS {
            registry.register(*type_name, build());
        }
        registry
    }

    /// Register a step, replacing any earlier one with the same type name.
    pub fn register(&mut self, type_name: impl Into<String>, executable: Executable) {
        let type_name = type_name.into();
        if self.steps.insert(type_name.clone(), executable).is_some() {
            log::debug!("Replaced step registration for '{}'", type_name);
        }
    }

    pub fn get(&self, type_name: &str) -> Option<&Executable> {
        self.steps.get(type_name)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.steps.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Selects the executable contract for a plan node.
pub struct Facilitator {
    registry: StepRegistry,
}

impl Facilitator {
    pub fn new(registry: StepRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// The executable registered for the node's step type. Unknown step
    /// types and contract mismatches are authoring errors.
    pub fn resolve(&self, node: &PlanNode) -> Result<Executable> {
        let executable = self.registry.get(&node.step_type.type_name).ok_or_else(|| {
            EngineError::invalid(format!(
                "no step registered for type '{}' (node '{}')",
                node.step_type.type_name, node.uuid
            ))
        })?;
        let implemented = executable.facilitator_type();
        if implemented != node.facilitator {
            return Err(EngineError::invalid(format!(
                "node '{}' declares facilitator {} but step '{}' implements {}",
                node.uuid, node.facilitator, node.step_type.type_name, implemented
            )));
        }
        Ok(executable.clone())
    }
}
