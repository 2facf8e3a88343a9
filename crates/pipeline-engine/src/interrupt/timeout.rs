//! Timeout interrupts for manual interventions
//!
//! When a node parks in `INTERVENTION_WAITING` the engine schedules a timer.
//! If nobody resolves the node first, the timer registers the configured
//! repair action as an interrupt issued by the timeout, so advisers can
//! tell it apart from an operator's decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use super::{InterruptManager, InterruptRequest, InterruptType, IssuedBy};
use crate::advise::RepairActionCode;
use crate::error::{EngineError, Result};
use crate::execution::NodeExecution;
use crate::outputs::{OutputScope, SweepingOutputStore, USE_PIPELINE_ROLLBACK_STRATEGY};

/// A scheduled timeout. Aborting it drops the pending interrupt.
pub struct TimeoutHandle {
    timeout_instance_id: String,
    task: JoinHandle<()>,
}

impl TimeoutHandle {
    pub fn timeout_instance_id(&self) -> &str {
        &self.timeout_instance_id
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

type PendingTimeouts = Arc<Mutex<HashMap<String, Vec<TimeoutHandle>>>>;

pub struct TimeoutScheduler {
    manager: Arc<InterruptManager>,
    outputs: Arc<SweepingOutputStore>,
    /// node execution id -> timers
    pending: PendingTimeouts,
}

impl TimeoutScheduler {
    pub fn new(manager: Arc<InterruptManager>, outputs: Arc<SweepingOutputStore>) -> Self {
        Self {
            manager,
            outputs,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Issue `repair_action` against `node` after `timeout_ms`. Returns the
    /// timeout instance id.
    pub fn schedule(
        &self,
        node: &NodeExecution,
        timeout_ms: u64,
        repair_action: RepairActionCode,
    ) -> Result<String> {
        let interrupt_type = InterruptType::for_repair_action(repair_action).ok_or_else(|| {
            EngineError::invalid(format!("{:?} has no timeout interrupt", repair_action))
        })?;
        let timeout_instance_id = uuid::Uuid::new_v4().to_string();

        let manager = self.manager.clone();
        let outputs = self.outputs.clone();
        let pending = self.pending.clone();
        let ambiance = node.ambiance.clone();
        let node_id = node.uuid.clone();
        let instance_id = timeout_instance_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            if let Some(handles) = pending.lock().get_mut(&node_id) {
                handles.retain(|h| h.timeout_instance_id != instance_id);
            }
            log::info!(
                "Intervention on node {} timed out after {}ms, issuing {}",
                node_id,
                timeout_ms,
                interrupt_type
            );
            if repair_action == RepairActionCode::PipelineRollback {
                if let Err(e) = outputs.consume(
                    &ambiance,
                    USE_PIPELINE_ROLLBACK_STRATEGY,
                    Value::Bool(true),
                    OutputScope::Pipeline,
                ) {
                    log::warn!("Could not request pipeline rollback for {}: {}", node_id, e);
                }
            }
            let request = InterruptRequest::new(
                interrupt_type,
                ambiance.plan_execution_id.clone(),
                IssuedBy::Timeout {
                    timeout_instance_id: instance_id,
                },
            )
            .for_node(node_id.clone());
            if let Err(e) = manager.register(request).await {
                log::warn!("Timeout interrupt for node {} not registered: {}", node_id, e);
            }
        });

        log::debug!(
            "Scheduled {} timeout {} for node {} in {}ms",
            interrupt_type,
            timeout_instance_id,
            node.uuid,
            timeout_ms
        );
        self.pending
            .lock()
            .entry(node.uuid.clone())
            .or_default()
            .push(TimeoutHandle {
                timeout_instance_id: timeout_instance_id.clone(),
                task,
            });
        Ok(timeout_instance_id)
    }

    /// Cancel every pending timeout of a node. Returns how many were
    /// cancelled.
    pub fn cancel_for_node(&self, node_execution_id: &str) -> usize {
        let handles = self
            .pending
            .lock()
            .remove(node_execution_id)
            .unwrap_or_default();
        let count = handles.len();
        for handle in handles {
            log::debug!(
                "Cancelled timeout {} of node {}",
                handle.timeout_instance_id(),
                node_execution_id
            );
            handle.cancel();
        }
        count
    }

    pub fn pending_for_node(&self, node_execution_id: &str) -> usize {
        self.pending
            .lock()
            .get(node_execution_id)
            .map_or(0, Vec::len)
    }
}
