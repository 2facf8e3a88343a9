//! Event plumbing between the engine and its consumers
//!
//! The engine never calls itself across a suspension point. It publishes a
//! message (start this node, resume that node, apply this interrupt, this
//! node changed status) and a consumer loop delivers it to a listener.
//! Delivery is at-least-once, so every handler is idempotent.

mod bus;
mod consumer;
mod payload;

pub use bus::{DeadLetter, InMemoryEventBus};
pub use consumer::{ConsumerHandle, ConsumerLoop};
pub use payload::{
    InterruptEvent, NodeResumeEvent, NodeStartEvent, NodeStatusUpdateEvent, StartChildPlanEvent,
};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use pipeline_contracts::Ambiance;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Topic names
pub mod topics {
    pub const ORCHESTRATION: &str = "orchestration";
    pub const NODE_STATUS: &str = "node_status";
    pub const INTERRUPT: &str = "interrupt";
}

/// Metadata keys set by producers
pub mod metadata_keys {
    pub const EVENT_TYPE: &str = "eventType";
    pub const PLAN_EXECUTION_ID: &str = "planExecutionId";
    pub const NODE_EXECUTION_ID: &str = "nodeExecutionId";
    pub const ACCOUNT_ID: &str = "accountId";
}

/// Kind of payload a message carries. Also the codec tag of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    NodeStart,
    NodeResume,
    StartChildPlan,
    NodeStatusUpdate,
    Interrupt,
}

impl EventCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            EventCategory::NodeStart => "NODE_START",
            EventCategory::NodeResume => "NODE_RESUME",
            EventCategory::StartChildPlan => "START_CHILD_PLAN",
            EventCategory::NodeStatusUpdate => "NODE_STATUS_UPDATE",
            EventCategory::Interrupt => "INTERRUPT",
        }
    }

    /// Topic a category is published on.
    pub fn topic(self) -> &'static str {
        match self {
            EventCategory::NodeStart
            | EventCategory::NodeResume
            | EventCategory::StartChildPlan => topics::ORCHESTRATION,
            EventCategory::NodeStatusUpdate => topics::NODE_STATUS,
            EventCategory::Interrupt => topics::INTERRUPT,
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NODE_START" => Ok(EventCategory::NodeStart),
            "NODE_RESUME" => Ok(EventCategory::NodeResume),
            "START_CHILD_PLAN" => Ok(EventCategory::StartChildPlan),
            "NODE_STATUS_UPDATE" => Ok(EventCategory::NodeStatusUpdate),
            "INTERRUPT" => Ok(EventCategory::Interrupt),
            other => Err(EngineError::invalid(format!("unknown event type '{}'", other))),
        }
    }
}

/// A message in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
    /// Epoch millis at first publication
    pub timestamp: i64,
    /// Deliver in order with other ordered messages of the same plan execution
    pub ordered: bool,
    pub delivery_attempt: u32,
}

impl Message {
    pub fn partition_key(&self) -> Option<&str> {
        self.metadata
            .get(metadata_keys::PLAN_EXECUTION_ID)
            .map(String::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.metadata.get(metadata_keys::EVENT_TYPE).map(String::as_str)
    }
}

/// Metadata every message carries, derived from the ambiance of its target.
pub fn metadata_for(ambiance: &Ambiance, category: EventCategory) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert(
        metadata_keys::EVENT_TYPE.to_string(),
        category.as_str().to_string(),
    );
    metadata.insert(
        metadata_keys::PLAN_EXECUTION_ID.to_string(),
        ambiance.plan_execution_id.clone(),
    );
    if let Some(runtime_id) = ambiance.current_runtime_id() {
        metadata.insert(
            metadata_keys::NODE_EXECUTION_ID.to_string(),
            runtime_id.to_string(),
        );
    }
    if let Some(account) = ambiance.account_id() {
        metadata.insert(metadata_keys::ACCOUNT_ID.to_string(), account.to_string());
    }
    metadata
}

/// Publishes payloads onto the bus.
#[async_trait]
pub trait EventProducer: Send + Sync {
    /// Returns the id of the published event.
    async fn send_event(
        &self,
        ambiance: &Ambiance,
        payload: Vec<u8>,
        category: EventCategory,
        topic: &str,
        ordered: bool,
    ) -> Result<String>;
}

/// Receives messages of one topic.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// `Ok(false)` acknowledges a message the listener chose not to act on.
    /// Errors are redelivered unless they are poison.
    async fn handle_message(
        &self,
        payload: &[u8],
        metadata: &BTreeMap<String, String>,
        timestamp: i64,
    ) -> Result<bool>;
}

/// Read the event type a message was published with.
pub fn event_category(metadata: &BTreeMap<String, String>) -> Result<EventCategory> {
    metadata
        .get(metadata_keys::EVENT_TYPE)
        .ok_or_else(|| EngineError::invalid("message has no eventType"))?
        .parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_contracts::{Level, StepType};

    #[test]
    fn test_metadata_from_ambiance() {
        let amb = Ambiance::new("pe-1", "plan")
            .with_setup_abstraction("accountId", "acc")
            .clone_for_child(Level::new("rt-1", "s1", "shell", StepType::step("SHELL")));
        let metadata = metadata_for(&amb, EventCategory::NodeStart);

        assert_eq!(metadata[metadata_keys::EVENT_TYPE], "NODE_START");
        assert_eq!(metadata[metadata_keys::PLAN_EXECUTION_ID], "pe-1");
        assert_eq!(metadata[metadata_keys::NODE_EXECUTION_ID], "rt-1");
        assert_eq!(metadata[metadata_keys::ACCOUNT_ID], "acc");
        assert_eq!(event_category(&metadata).unwrap(), EventCategory::NodeStart);
    }

    #[test]
    fn test_unknown_event_type_is_invalid_arguments() {
        let mut metadata = BTreeMap::new();
        metadata.insert(metadata_keys::EVENT_TYPE.to_string(), "NODE_TELEPORT".to_string());
        assert!(matches!(
            event_category(&metadata),
            Err(EngineError::InvalidArguments(_))
        ));
        assert!(event_category(&BTreeMap::new()).unwrap_err().is_poison());
    }

    #[test]
    fn test_categories_route_to_topics() {
        assert_eq!(EventCategory::NodeResume.topic(), topics::ORCHESTRATION);
        assert_eq!(EventCategory::Interrupt.topic(), topics::INTERRUPT);
        assert_eq!(EventCategory::NodeStatusUpdate.topic(), topics::NODE_STATUS);
    }
}
