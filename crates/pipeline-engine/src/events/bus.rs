//! In-process message bus based on tokio channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_contracts::Ambiance;
use tokio::sync::mpsc;

use super::{metadata_for, EventCategory, EventProducer, Message};
use crate::error::{EngineError, Result};

/// A message that will not be delivered again.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: String,
}

struct TopicChannel {
    tx: mpsc::UnboundedSender<Message>,
    rx: Option<mpsc::UnboundedReceiver<Message>>,
}

impl TopicChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

/// One queue per topic with a single consumer each.
#[derive(Default)]
pub struct InMemoryEventBus {
    topics: Mutex<HashMap<String, TopicChannel>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    published: AtomicU64,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the receiving end of a topic. Each topic has one consumer.
    pub fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Message>> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_insert_with(TopicChannel::new)
            .rx
            .take()
            .ok_or_else(|| EngineError::Bus(format!("topic '{}' already has a consumer", topic)))
    }

    /// Enqueue a message as is. Used for first delivery and redelivery.
    pub fn publish(&self, message: Message) -> Result<()> {
        let topics_tx = {
            let mut topics = self.topics.lock();
            topics
                .entry(message.topic.clone())
                .or_insert_with(TopicChannel::new)
                .tx
                .clone()
        };
        topics_tx
            .send(message)
            .map_err(|e| EngineError::Bus(format!("topic '{}' closed", e.0.topic)))?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn dead_letter(&self, message: Message, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!(
            "Dead-lettering message {} on '{}' ({:?}): {}",
            message.id,
            message.topic,
            message.event_type(),
            reason
        );
        self.dead_letters.lock().push(DeadLetter { message, reason });
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().clone()
    }

    /// Messages enqueued so far, redeliveries included.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventProducer for InMemoryEventBus {
    async fn send_event(
        &self,
        ambiance: &Ambiance,
        payload: Vec<u8>,
        category: EventCategory,
        topic: &str,
        ordered: bool,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let message = Message {
            id: id.clone(),
            topic: topic.to_string(),
            payload,
            metadata: metadata_for(ambiance, category),
            timestamp: crate::now_millis(),
            ordered,
            delivery_attempt: 1,
        };
        log::trace!("Publishing {} {} on '{}'", category, id, topic);
        self.publish(message)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_category, topics};

    #[test]
    fn test_send_event_delivers_to_subscriber() {
        tokio_test::block_on(async {
            let bus = InMemoryEventBus::new();
            let mut rx = bus.subscribe(topics::ORCHESTRATION).unwrap();

            let amb = Ambiance::new("pe-1", "plan");
            let id = bus
                .send_event(
                    &amb,
                    b"{}".to_vec(),
                    EventCategory::NodeStart,
                    topics::ORCHESTRATION,
                    false,
                )
                .await
                .unwrap();

            let message = rx.recv().await.expect("message");
            assert_eq!(message.id, id);
            assert_eq!(message.partition_key(), Some("pe-1"));
            assert_eq!(
                event_category(&message.metadata).unwrap(),
                EventCategory::NodeStart
            );
            assert_eq!(bus.published_count(), 1);
        });
    }

    #[test]
    fn test_publish_before_subscribe_is_buffered() {
        tokio_test::block_on(async {
            let bus = InMemoryEventBus::new();
            bus.send_event(
                &Ambiance::new("pe", "p"),
                Vec::new(),
                EventCategory::Interrupt,
                topics::INTERRUPT,
                true,
            )
            .await
            .unwrap();

            let mut rx = bus.subscribe(topics::INTERRUPT).unwrap();
            assert!(rx.recv().await.unwrap().ordered);
        });
    }

    #[test]
    fn test_second_subscriber_rejected() {
        let bus = InMemoryEventBus::new();
        let _rx = bus.subscribe(topics::NODE_STATUS).unwrap();
        assert!(matches!(
            bus.subscribe(topics::NODE_STATUS),
            Err(EngineError::Bus(_))
        ));
    }
}
