//! In-process runtime: engine, bus and one consumer per topic

use std::sync::Arc;
use std::time::Duration;

use super::{
    EngineBuilder, InterruptListener, NodeStatusListener, OrchestrationEngine,
    OrchestrationListener,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{topics, ConsumerHandle, ConsumerLoop, InMemoryEventBus, MessageListener};
use crate::execution::{NodeExecution, PlanExecution};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct OrchestrationRuntime {
    engine: Arc<OrchestrationEngine>,
    bus: Arc<InMemoryEventBus>,
    consumers: Vec<ConsumerHandle>,
}

impl OrchestrationRuntime {
    /// Start a runtime with default collaborators. Must be called inside a
    /// tokio runtime.
    pub fn start(config: EngineConfig) -> Result<Self> {
        Self::start_with(EngineBuilder::new(config))
    }

    pub fn start_with(builder: EngineBuilder) -> Result<Self> {
        let bus = Arc::new(InMemoryEventBus::new());
        let engine = Arc::new(builder.build(bus.clone())?);
        let consumer_config = engine.config().consumer.clone();

        let listeners: [(&str, Arc<dyn MessageListener>); 3] = [
            (
                topics::ORCHESTRATION,
                Arc::new(OrchestrationListener::new(engine.clone())),
            ),
            (
                topics::NODE_STATUS,
                Arc::new(NodeStatusListener::new(engine.clone())),
            ),
            (
                topics::INTERRUPT,
                Arc::new(InterruptListener::new(engine.clone())),
            ),
        ];
        let consumers = listeners
            .into_iter()
            .map(|(topic, listener)| {
                ConsumerLoop::new(topic, bus.clone(), listener, consumer_config.clone()).spawn()
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!("Orchestration runtime started with {} consumers", consumers.len());
        Ok(Self {
            engine,
            bus,
            consumers,
        })
    }

    pub fn engine(&self) -> &Arc<OrchestrationEngine> {
        &self.engine
    }

    pub fn bus(&self) -> &Arc<InMemoryEventBus> {
        &self.bus
    }

    /// Wait until a plan execution reaches a final status.
    pub async fn wait_for_plan(
        &self,
        plan_execution_id: &str,
        timeout: Duration,
    ) -> Result<PlanExecution> {
        let plan_executions = self.engine.plan_executions().clone();
        self.poll(timeout, format!("plan execution {}", plan_execution_id), || {
            let plan_executions = plan_executions.clone();
            let id = plan_execution_id.to_string();
            async move {
                let pe = plan_executions.get(&id).await?;
                Ok(pe.status.is_final().then_some(pe))
            }
        })
        .await
    }

    /// Wait until some node execution of a plan execution matches
    /// `predicate`.
    pub async fn wait_for_node<P>(
        &self,
        plan_execution_id: &str,
        timeout: Duration,
        predicate: P,
    ) -> Result<NodeExecution>
    where
        P: Fn(&NodeExecution) -> bool,
    {
        let nodes = self.engine.node_executions().clone();
        let predicate = &predicate;
        self.poll(
            timeout,
            format!("node of plan execution {}", plan_execution_id),
            || {
                let nodes = nodes.clone();
                let id = plan_execution_id.to_string();
                async move {
                    let found = nodes.find_by_plan_execution_id(&id).await?;
                    Ok(found.into_iter().find(|n| predicate(n)))
                }
            },
        )
        .await
    }

    async fn poll<T, F, Fut>(&self, timeout: Duration, what: String, mut check: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Option<T>>>,
    {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if let Some(found) = check().await? {
                    return Ok::<T, EngineError>(found);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await;
        match waited {
            Ok(result) => result,
            Err(_) => Err(EngineError::failed(format!(
                "timed out after {:?} waiting for {}",
                timeout, what
            ))),
        }
    }

    /// Stop every consumer. Messages still queued are not delivered.
    pub fn shutdown(self) {
        for consumer in self.consumers {
            consumer.shutdown();
        }
        log::info!("Orchestration runtime stopped");
    }
}
