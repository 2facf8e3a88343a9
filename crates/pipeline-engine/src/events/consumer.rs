//! Consumer loop: delivers one topic's messages to a listener
//!
//! Handlers run concurrently up to the configured limit. Ordered messages of
//! the same plan execution are handled one at a time. A failing handler is
//! redelivered with linear backoff; poison messages (undecodable payloads,
//! unknown event types) go straight to the dead-letter list. A partition
//! lock lives only while some handler of its plan execution holds it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;

use super::{InMemoryEventBus, Message, MessageListener};
use crate::config::ConsumerConfig;
use crate::error::Result;

type PartitionLocks = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

pub struct ConsumerLoop {
    topic: String,
    bus: Arc<InMemoryEventBus>,
    listener: Arc<dyn MessageListener>,
    config: ConsumerConfig,
}

/// Running consumer. Dropping the handle does not stop the loop; call
/// [`ConsumerHandle::shutdown`].
pub struct ConsumerHandle {
    topic: String,
    task: JoinHandle<()>,
    partitions: PartitionLocks,
}

impl ConsumerHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Plan executions with an ordered handler running or queued.
    pub fn open_partitions(&self) -> usize {
        self.partitions.lock().len()
    }

    pub fn shutdown(self) {
        log::debug!("Stopping consumer for '{}'", self.topic);
        self.task.abort();
    }
}

impl ConsumerLoop {
    pub fn new(
        topic: impl Into<String>,
        bus: Arc<InMemoryEventBus>,
        listener: Arc<dyn MessageListener>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            topic: topic.into(),
            bus,
            listener,
            config,
        }
    }

    /// Subscribe to the topic and start consuming on the current runtime.
    pub fn spawn(self) -> Result<ConsumerHandle> {
        let mut rx = self.bus.subscribe(&self.topic)?;
        let topic = self.topic.clone();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let partitions: PartitionLocks = Arc::new(Mutex::new(HashMap::new()));
        let open = partitions.clone();
        let consumer = Arc::new(self);

        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let consumer = consumer.clone();
                let partitions = partitions.clone();
                tokio::spawn(async move {
                    consumer.deliver(message, &partitions).await;
                    drop(permit);
                });
            }
            log::debug!("Consumer loop for '{}' exited", consumer.topic);
        });

        log::info!("Started consumer for '{}'", topic);
        Ok(ConsumerHandle {
            topic,
            task,
            partitions: open,
        })
    }

    async fn deliver(&self, message: Message, partitions: &PartitionLocks) {
        let partition = match (message.ordered, message.partition_key()) {
            (true, Some(key)) => {
                let lock = partitions
                    .lock()
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                    .clone();
                Some((key.to_string(), lock))
            }
            _ => None,
        };
        let guard = match &partition {
            Some((_, lock)) => Some(lock.lock().await),
            None => None,
        };

        let result = self
            .listener
            .handle_message(&message.payload, &message.metadata, message.timestamp)
            .await;
        drop(guard);
        if let Some((key, lock)) = partition {
            Self::release_partition(partitions, &key, lock);
        }

        let err = match result {
            Ok(handled) => {
                if !handled {
                    log::trace!("Message {} on '{}' ignored by listener", message.id, self.topic);
                }
                return;
            }
            Err(err) => err,
        };

        if err.is_poison() {
            self.bus.dead_letter(message, err.to_string());
            return;
        }

        log::error!(
            "Handler failed for {:?} on '{}' (plan execution {:?}, attempt {}): {}",
            message.event_type(),
            self.topic,
            message.partition_key(),
            message.delivery_attempt,
            err
        );

        if message.delivery_attempt >= self.config.max_delivery_attempts {
            self.bus.dead_letter(message, err.to_string());
            return;
        }

        let backoff =
            Duration::from_millis(self.config.redelivery_backoff_ms * u64::from(message.delivery_attempt));
        let bus = self.bus.clone();
        let mut retry = message;
        retry.delivery_attempt += 1;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Err(e) = bus.publish(retry) {
                log::error!("Redelivery failed: {}", e);
            }
        });
    }

    /// Drop the map entry once no other handler holds or waits on the lock.
    /// Clones are only taken under the map mutex, so the count is stable here.
    fn release_partition(partitions: &PartitionLocks, key: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = partitions.lock();
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }
}
