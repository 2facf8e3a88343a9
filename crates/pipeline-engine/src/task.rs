//! Hand-off of task executables to an external delegate
//!
//! The engine only correlates: it dispatches a [`TaskRequest`], parks the
//! node in `TASK_WAITING` on the returned task id, and resumes it when the
//! delegate reports back through [`OrchestrationEngine::notify`].
//!
//! [`OrchestrationEngine::notify`]: crate::engine::OrchestrationEngine::notify

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_contracts::Ambiance;

use crate::error::Result;
use crate::executable::TaskRequest;

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Queue `request` with a delegate and return its task id.
    async fn dispatch(&self, ambiance: &Ambiance, request: TaskRequest) -> Result<String>;
}

/// A task handed to [`RecordingTaskDispatcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedTask {
    pub task_id: String,
    pub node_execution_id: Option<String>,
    pub request: TaskRequest,
}

/// Dispatcher that keeps every request in memory. Callers complete tasks by
/// notifying the engine with the task id.
#[derive(Default)]
pub struct RecordingTaskDispatcher {
    dispatched: Mutex<Vec<DispatchedTask>>,
}

impl RecordingTaskDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> Vec<DispatchedTask> {
        self.dispatched.lock().clone()
    }

    pub fn find_for_node(&self, node_execution_id: &str) -> Option<DispatchedTask> {
        self.dispatched
            .lock()
            .iter()
            .find(|t| t.node_execution_id.as_deref() == Some(node_execution_id))
            .cloned()
    }
}

#[async_trait]
impl TaskDispatcher for RecordingTaskDispatcher {
    async fn dispatch(&self, ambiance: &Ambiance, request: TaskRequest) -> Result<String> {
        let task_id = uuid::Uuid::new_v4().to_string();
        log::debug!(
            "Dispatching {} task {} for {}",
            request.task_type,
            task_id,
            ambiance.fqn()
        );
        self.dispatched.lock().push(DispatchedTask {
            task_id: task_id.clone(),
            node_execution_id: ambiance.current_runtime_id().map(str::to_string),
            request,
        });
        Ok(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_contracts::{Level, StepType};
    use serde_json::json;

    #[tokio::test]
    async fn test_records_dispatch_by_node() {
        let dispatcher = RecordingTaskDispatcher::new();
        let amb = Ambiance::new("pe", "p")
            .clone_for_child(Level::new("rt-1", "s", "http", StepType::step("HTTP")));
        let task_id = dispatcher
            .dispatch(
                &amb,
                TaskRequest {
                    task_type: "HTTP".into(),
                    payload: json!({"url": "http://example.invalid"}),
                },
            )
            .await
            .unwrap();

        let task = dispatcher.find_for_node("rt-1").unwrap();
        assert_eq!(task.task_id, task_id);
        assert_eq!(dispatcher.dispatched().len(), 1);
    }
}
