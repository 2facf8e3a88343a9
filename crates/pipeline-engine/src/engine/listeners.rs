//! Message listeners feeding the engine
//!
//! One listener per topic. Each decodes the payload under its event type
//! and hands it to the engine. Messages about records that no longer exist
//! are acknowledged and dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::OrchestrationEngine;
use crate::error::{EngineError, Result};
use crate::events::{
    event_category, EventCategory, InterruptEvent, MessageListener, NodeResumeEvent,
    NodeStartEvent, NodeStatusUpdateEvent, StartChildPlanEvent,
};

fn unexpected(category: EventCategory, topic: &str) -> EngineError {
    EngineError::invalid(format!("{} is not handled on topic {}", category, topic))
}

/// Node start, node resume and chained plan launches.
pub struct OrchestrationListener {
    engine: Arc<OrchestrationEngine>,
}

impl OrchestrationListener {
    pub fn new(engine: Arc<OrchestrationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MessageListener for OrchestrationListener {
    async fn handle_message(
        &self,
        payload: &[u8],
        metadata: &BTreeMap<String, String>,
        _timestamp: i64,
    ) -> Result<bool> {
        let category = event_category(metadata)?;
        let result = match category {
            EventCategory::NodeStart => {
                let event: NodeStartEvent = self.engine.decode(category, payload)?;
                self.engine.start_node(&event.node_execution_id).await
            }
            EventCategory::NodeResume => {
                let event: NodeResumeEvent = self.engine.decode(category, payload)?;
                self.engine
                    .resume_node(&event.node_execution_id, event.responses)
                    .await
            }
            EventCategory::StartChildPlan => {
                let event: StartChildPlanEvent = self.engine.decode(category, payload)?;
                self.engine.start_child_plan(event).await
            }
            other => return Err(unexpected(other, crate::events::topics::ORCHESTRATION)),
        };
        OrchestrationEngine::drop_stale(result)
    }
}

pub struct NodeStatusListener {
    engine: Arc<OrchestrationEngine>,
}

impl NodeStatusListener {
    pub fn new(engine: Arc<OrchestrationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MessageListener for NodeStatusListener {
    async fn handle_message(
        &self,
        payload: &[u8],
        metadata: &BTreeMap<String, String>,
        _timestamp: i64,
    ) -> Result<bool> {
        match event_category(metadata)? {
            EventCategory::NodeStatusUpdate => {
                let event: NodeStatusUpdateEvent =
                    self.engine.decode(EventCategory::NodeStatusUpdate, payload)?;
                OrchestrationEngine::drop_stale(self.engine.handle_status_update(event).await)
            }
            other => Err(unexpected(other, crate::events::topics::NODE_STATUS)),
        }
    }
}

pub struct InterruptListener {
    engine: Arc<OrchestrationEngine>,
}

impl InterruptListener {
    pub fn new(engine: Arc<OrchestrationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MessageListener for InterruptListener {
    async fn handle_message(
        &self,
        payload: &[u8],
        metadata: &BTreeMap<String, String>,
        _timestamp: i64,
    ) -> Result<bool> {
        match event_category(metadata)? {
            EventCategory::Interrupt => {
                let event: InterruptEvent = self.engine.decode(EventCategory::Interrupt, payload)?;
                OrchestrationEngine::drop_stale(self.engine.handle_interrupt(event).await)
            }
            other => Err(unexpected(other, crate::events::topics::INTERRUPT)),
        }
    }
}
