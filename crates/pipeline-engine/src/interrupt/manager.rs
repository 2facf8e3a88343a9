//! Interrupt registration and lookup

use std::sync::Arc;

use crate::codec::{self, Codec};
use crate::error::{EngineError, Result};
use crate::events::{topics, EventCategory, EventProducer, InterruptEvent};
use crate::execution::{NodeExecutionService, PlanExecutionService};
use crate::persistence::update_with_retries;

use super::{Interrupt, InterruptState, InterruptStore, InterruptType, IssuedBy};

/// What a caller asks to interrupt.
#[derive(Debug, Clone, PartialEq)]
pub struct InterruptRequest {
    pub interrupt_type: InterruptType,
    pub plan_execution_id: String,
    pub node_execution_id: Option<String>,
    pub issued_by: IssuedBy,
}

impl InterruptRequest {
    pub fn new(
        interrupt_type: InterruptType,
        plan_execution_id: impl Into<String>,
        issued_by: IssuedBy,
    ) -> Self {
        Self {
            interrupt_type,
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: None,
            issued_by,
        }
    }

    pub fn for_node(mut self, node_execution_id: impl Into<String>) -> Self {
        self.node_execution_id = Some(node_execution_id.into());
        self
    }
}

/// Registers interrupts and hands them to the interrupt topic.
pub struct InterruptManager {
    store: Arc<dyn InterruptStore>,
    plans: Arc<PlanExecutionService>,
    nodes: Arc<NodeExecutionService>,
    producer: Arc<dyn EventProducer>,
    codec: Arc<dyn Codec>,
    max_update_retries: u32,
    /// Serializes ABORT_ALL registration so the active check and the insert
    /// are not interleaved.
    abort_all: tokio::sync::Mutex<()>,
}

impl InterruptManager {
    pub fn new(
        store: Arc<dyn InterruptStore>,
        plans: Arc<PlanExecutionService>,
        nodes: Arc<NodeExecutionService>,
        producer: Arc<dyn EventProducer>,
        codec: Arc<dyn Codec>,
        max_update_retries: u32,
    ) -> Self {
        Self {
            store,
            plans,
            nodes,
            producer,
            codec,
            max_update_retries,
            abort_all: tokio::sync::Mutex::new(()),
        }
    }

    /// Validate, persist and publish an interrupt.
    ///
    /// Registering ABORT_ALL while one is still active for the same plan
    /// execution returns the active one instead of creating another.
    pub async fn register(&self, request: InterruptRequest) -> Result<Interrupt> {
        let plan = self.plans.get(&request.plan_execution_id).await?;
        if plan.status.is_final() {
            return Err(EngineError::invalid(format!(
                "plan execution {} already finished with {}",
                plan.uuid, plan.status
            )));
        }
        if request.interrupt_type.requires_node() && request.node_execution_id.is_none() {
            return Err(EngineError::invalid(format!(
                "{} interrupt needs a node execution",
                request.interrupt_type
            )));
        }
        let ambiance = match &request.node_execution_id {
            Some(node_id) => {
                let node = self.nodes.get(node_id).await?;
                if node.plan_execution_id() != request.plan_execution_id {
                    return Err(EngineError::invalid(format!(
                        "node execution {} is not part of plan execution {}",
                        node_id, request.plan_execution_id
                    )));
                }
                node.ambiance
            }
            None => plan.ambiance.clone(),
        };

        let interrupt = Interrupt {
            uuid: uuid::Uuid::new_v4().to_string(),
            interrupt_type: request.interrupt_type,
            plan_execution_id: request.plan_execution_id.clone(),
            node_execution_id: request.node_execution_id.clone(),
            issued_by: request.issued_by.clone(),
            state: InterruptState::Registered,
            created_at: crate::now_millis(),
            version: 0,
        };

        let interrupt = if request.interrupt_type == InterruptType::AbortAll {
            let _guard = self.abort_all.lock().await;
            let active = self
                .store
                .fetch_active(&request.plan_execution_id, InterruptType::AbortAll)
                .await?;
            if let Some(existing) = active.into_iter().next() {
                log::debug!(
                    "ABORT_ALL already active for plan execution {} ({})",
                    request.plan_execution_id,
                    existing.uuid
                );
                return Ok(existing);
            }
            self.store.insert(interrupt).await?
        } else {
            self.store.insert(interrupt).await?
        };

        let event = InterruptEvent {
            interrupt_id: interrupt.uuid.clone(),
            interrupt_type: interrupt.interrupt_type,
            notify_id: uuid::Uuid::new_v4().to_string(),
            node_execution_id: interrupt.node_execution_id.clone(),
        };
        let category = EventCategory::Interrupt;
        let payload = codec::encode(self.codec.as_ref(), category.as_str(), &event)?;
        self.producer
            .send_event(&ambiance, payload, category, topics::INTERRUPT, true)
            .await?;

        log::info!(
            "Registered {} interrupt {} for plan execution {}{} ({:?})",
            interrupt.interrupt_type,
            interrupt.uuid,
            interrupt.plan_execution_id,
            interrupt
                .node_execution_id
                .as_deref()
                .map(|n| format!(" node {}", n))
                .unwrap_or_default(),
            interrupt.issued_by
        );
        Ok(interrupt)
    }

    pub async fn get(&self, interrupt_id: &str) -> Result<Interrupt> {
        self.store.get(interrupt_id).await
    }

    pub async fn fetch_for_plan(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        self.store.fetch_for_plan(plan_execution_id).await
    }

    pub async fn fetch_active(
        &self,
        plan_execution_id: &str,
        interrupt_type: InterruptType,
    ) -> Result<Vec<Interrupt>> {
        self.store
            .fetch_active(plan_execution_id, interrupt_type)
            .await
    }

    /// Move an interrupt from `from` to `to`. `None` if it was no longer in
    /// `from`, which makes processing claim an interrupt exactly once.
    pub async fn transition(
        &self,
        interrupt_id: &str,
        from: InterruptState,
        to: InterruptState,
    ) -> Result<Option<Interrupt>> {
        update_with_retries(
            self.store.as_ref(),
            interrupt_id,
            self.max_update_retries,
            |interrupt: &mut Interrupt| {
                if interrupt.state != from {
                    return false;
                }
                interrupt.state = to;
                true
            },
        )
        .await
    }
}
