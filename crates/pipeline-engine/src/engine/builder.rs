//! Assembly of an engine from its stores, codec and steps

use std::sync::Arc;

use super::OrchestrationEngine;
use crate::advise::{AdviseChain, AdviserContext};
use crate::barrier::{BarrierService, BarrierStore, InMemoryBarrierStore};
use crate::codec::{Codec, JsonCodec};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::EventProducer;
use crate::executable::Executable;
use crate::execution::{
    ExecutionArchive, InMemoryNodeExecutionStore, InMemoryPlanExecutionStore,
    NodeExecutionService, NodeExecutionStore, PlanExecutionService, PlanExecutionStore,
};
use crate::interrupt::{InMemoryInterruptStore, InterruptManager, InterruptStore, TimeoutScheduler};
use crate::outputs::SweepingOutputStore;
use crate::plan::PlanStore;
use crate::steps::{Facilitator, StepRegistry};
use crate::task::{RecordingTaskDispatcher, TaskDispatcher};
use crate::waiter::WaitNotifyEngine;

/// Assembles an [`OrchestrationEngine`].
///
/// Every collaborator defaults to its in-memory implementation; override
/// the ones backed by real storage or a real task delegate.
///
/// # Example
///
/// ```ignore
/// let engine = EngineBuilder::new(EngineConfig::default())
///     .with_step("SHELL", Executable::Sync(Arc::new(ShellStep)))
///     .with_task_dispatcher(Arc::new(MyDelegate::new()))
///     .build(bus.clone())?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    codec: Arc<dyn Codec>,
    plans: Option<Arc<PlanStore>>,
    steps: StepRegistry,
    tasks: Arc<dyn TaskDispatcher>,
    node_store: Arc<dyn NodeExecutionStore>,
    plan_execution_store: Arc<dyn PlanExecutionStore>,
    interrupt_store: Arc<dyn InterruptStore>,
    barrier_store: Arc<dyn BarrierStore>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            codec: Arc::new(JsonCodec),
            plans: None,
            steps: StepRegistry::with_builtins(),
            tasks: Arc::new(RecordingTaskDispatcher::new()),
            node_store: Arc::new(InMemoryNodeExecutionStore::new()),
            plan_execution_store: Arc::new(InMemoryPlanExecutionStore::new()),
            interrupt_store: Arc::new(InMemoryInterruptStore::new()),
            barrier_store: Arc::new(InMemoryBarrierStore::new()),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Share an existing plan store instead of opening one from the config.
    pub fn with_plan_store(mut self, plans: Arc<PlanStore>) -> Self {
        self.plans = Some(plans);
        self
    }

    pub fn with_task_dispatcher(mut self, tasks: Arc<dyn TaskDispatcher>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Register a step type on top of the built-in ones.
    pub fn with_step(mut self, type_name: impl Into<String>, executable: Executable) -> Self {
        self.steps.register(type_name, executable);
        self
    }

    pub fn with_node_store(mut self, store: Arc<dyn NodeExecutionStore>) -> Self {
        self.node_store = store;
        self
    }

    pub fn with_plan_execution_store(mut self, store: Arc<dyn PlanExecutionStore>) -> Self {
        self.plan_execution_store = store;
        self
    }

    pub fn with_interrupt_store(mut self, store: Arc<dyn InterruptStore>) -> Self {
        self.interrupt_store = store;
        self
    }

    pub fn with_barrier_store(mut self, store: Arc<dyn BarrierStore>) -> Self {
        self.barrier_store = store;
        self
    }

    pub fn build(self, producer: Arc<dyn EventProducer>) -> Result<OrchestrationEngine> {
        self.config.validate()?;
        let retries = self.config.max_update_retries;

        let plans = match (self.plans, &self.config.plan_store_path) {
            (Some(plans), _) => plans,
            (None, Some(path)) => {
                let store = PlanStore::with_persistence(path);
                let loaded = store.load_from_disk()?;
                log::info!("Loaded {} plans from {}", loaded, path.display());
                Arc::new(store)
            }
            (None, None) => Arc::new(PlanStore::new()),
        };

        let nodes = Arc::new(NodeExecutionService::new(self.node_store, retries));
        let plan_executions = Arc::new(PlanExecutionService::new(
            self.plan_execution_store,
            retries,
        ));
        let interrupts = Arc::new(InterruptManager::new(
            self.interrupt_store,
            plan_executions.clone(),
            nodes.clone(),
            producer.clone(),
            self.codec.clone(),
            retries,
        ));
        let outputs = Arc::new(SweepingOutputStore::new());
        let advise = AdviseChain::new(AdviserContext {
            codec: self.codec.clone(),
            outputs: outputs.clone(),
            default_intervention_timeout_ms: self.config.default_intervention_timeout_ms,
        });

        log::debug!(
            "Building orchestration engine with {} step types",
            self.steps.len()
        );
        Ok(OrchestrationEngine {
            timeouts: TimeoutScheduler::new(interrupts.clone(), outputs.clone()),
            barriers: BarrierService::new(self.barrier_store, retries),
            waiter: WaitNotifyEngine::new(),
            facilitator: Facilitator::new(self.steps),
            archive: ExecutionArchive::new(self.config.compression_level),
            codec: self.codec,
            tasks: self.tasks,
            config: self.config,
            plans,
            nodes,
            plan_executions,
            interrupts,
            outputs,
            advise,
            producer,
        })
    }
}
