//! Wait/notify correlation of asynchronous callbacks
//!
//! A suspended node registers the correlation ids it waits for (child
//! runtime ids, a task id, a child plan execution id, its own id for
//! barriers). Callbacks arrive in any order and possibly more than once;
//! the node is resumed exactly once, when every expected id has reported.
//!
//! Everything recorded for a plan execution is dropped by
//! [`WaitNotifyEngine::forget_plan`] once the plan ends. Callbacks that
//! arrive with no known plan are parked up to a fixed capacity.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use pipeline_contracts::{FailureInfo, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a callback reports for one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcomes: BTreeMap<String, Value>,
    /// Identifier of the reporting node or task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl NotifyResponse {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            failure_info: None,
            outcomes: BTreeMap::new(),
            identifier: None,
            data: Value::Null,
        }
    }

    pub fn with_failure(mut self, failure_info: FailureInfo) -> Self {
        self.failure_info = Some(failure_info);
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Parked callbacks kept for ids no plan has claimed yet
pub const MAX_UNATTRIBUTED_PARKED: usize = 4096;

/// Responses keyed by correlation id.
pub type ResponseMap = BTreeMap<String, NotifyResponse>;

/// A wait whose every correlation id has reported.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedWait {
    pub waiting_node_id: String,
    pub responses: ResponseMap,
}

struct WaitEntry {
    expected: BTreeSet<String>,
    received: ResponseMap,
}

#[derive(Default)]
struct WaitState {
    waits: HashMap<String, WaitEntry>,
    /// correlation id -> waiting node id
    index: HashMap<String, String>,
    /// responses that arrived before anyone waited on them
    pending: HashMap<String, NotifyResponse>,
    /// correlation ids whose wait completed or was cancelled
    closed: HashSet<String>,
    /// plan execution id -> correlation and waiting node ids recorded for it
    plans: HashMap<String, HashSet<String>>,
    /// parked ids with no plan, oldest first
    unattributed: VecDeque<String>,
}

impl WaitState {
    fn record(&mut self, plan_execution_id: &str, id: &str) {
        self.plans
            .entry(plan_execution_id.to_string())
            .or_default()
            .insert(id.to_string());
    }

    fn park(&mut self, plan_execution_id: Option<&str>, correlation_id: &str, response: NotifyResponse) {
        let fresh = self
            .pending
            .insert(correlation_id.to_string(), response)
            .is_none();
        match plan_execution_id {
            Some(plan_execution_id) => self.record(plan_execution_id, correlation_id),
            None if fresh => {
                self.unattributed.push_back(correlation_id.to_string());
                while self.unattributed.len() > MAX_UNATTRIBUTED_PARKED {
                    if let Some(oldest) = self.unattributed.pop_front() {
                        log::warn!("Dropping unclaimed notification for {}", oldest);
                        self.pending.remove(&oldest);
                    }
                }
            }
            None => {}
        }
    }
}

#[derive(Default)]
pub struct WaitNotifyEngine {
    state: Mutex<WaitState>,
}

impl WaitNotifyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `waiting_node_id` of `plan_execution_id` as waiting for all
    /// `correlation_ids`.
    ///
    /// Returns the completed wait right away if every response was already
    /// parked.
    pub fn wait_for_all(
        &self,
        plan_execution_id: &str,
        waiting_node_id: &str,
        correlation_ids: impl IntoIterator<Item = String>,
    ) -> Option<CompletedWait> {
        let mut state = self.state.lock();
        let mut entry = WaitEntry {
            expected: correlation_ids.into_iter().collect(),
            received: ResponseMap::new(),
        };
        state.record(plan_execution_id, waiting_node_id);
        for id in &entry.expected {
            if let Some(response) = state.pending.remove(id) {
                entry.received.insert(id.clone(), response);
            }
            state.index.insert(id.clone(), waiting_node_id.to_string());
            state.record(plan_execution_id, id);
        }
        log::trace!(
            "Node {} waiting on {} callbacks",
            waiting_node_id,
            entry.expected.len()
        );
        state.waits.insert(waiting_node_id.to_string(), entry);
        Self::try_complete(&mut state, waiting_node_id)
    }

    /// Record a response. Returns the completed wait exactly once, when the
    /// received ids cover the expected ids.
    pub fn notify(&self, correlation_id: &str, response: NotifyResponse) -> Option<CompletedWait> {
        self.deliver(None, correlation_id, response)
    }

    /// [`notify`](Self::notify) for a callback known to belong to
    /// `plan_execution_id`; a parked response is dropped with that plan.
    pub fn notify_in(
        &self,
        plan_execution_id: &str,
        correlation_id: &str,
        response: NotifyResponse,
    ) -> Option<CompletedWait> {
        self.deliver(Some(plan_execution_id), correlation_id, response)
    }

    fn deliver(
        &self,
        plan_execution_id: Option<&str>,
        correlation_id: &str,
        response: NotifyResponse,
    ) -> Option<CompletedWait> {
        let mut state = self.state.lock();
        if state.closed.contains(correlation_id) {
            log::debug!("Dropping late notification for {}", correlation_id);
            return None;
        }
        let Some(waiting_node_id) = state.index.get(correlation_id).cloned() else {
            state.park(plan_execution_id, correlation_id, response);
            return None;
        };
        if let Some(entry) = state.waits.get_mut(&waiting_node_id) {
            entry.received.insert(correlation_id.to_string(), response);
        }
        Self::try_complete(&mut state, &waiting_node_id)
    }

    fn try_complete(state: &mut WaitState, waiting_node_id: &str) -> Option<CompletedWait> {
        let done = state
            .waits
            .get(waiting_node_id)
            .is_some_and(|e| e.expected.iter().all(|id| e.received.contains_key(id)));
        if !done {
            return None;
        }
        let entry = state.waits.remove(waiting_node_id)?;
        for id in &entry.expected {
            state.index.remove(id);
            state.closed.insert(id.clone());
        }
        Some(CompletedWait {
            waiting_node_id: waiting_node_id.to_string(),
            responses: entry.received,
        })
    }

    /// Drop a wait; later notifications for its ids are ignored.
    pub fn cancel(&self, waiting_node_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.waits.remove(waiting_node_id) else {
            return false;
        };
        for id in entry.expected {
            state.index.remove(&id);
            state.pending.remove(&id);
            state.closed.insert(id);
        }
        true
    }

    /// Correlation ids still outstanding for a wait.
    pub fn missing(&self, waiting_node_id: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .waits
            .get(waiting_node_id)
            .map(|e| {
                e.expected
                    .iter()
                    .filter(|id| !e.received.contains_key(*id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_waiting(&self, waiting_node_id: &str) -> bool {
        self.state.lock().waits.contains_key(waiting_node_id)
    }

    /// Drop every wait, parked response and closed id recorded for a
    /// finished plan execution.
    pub fn forget_plan(&self, plan_execution_id: &str) -> usize {
        let mut state = self.state.lock();
        let Some(ids) = state.plans.remove(plan_execution_id) else {
            return 0;
        };
        for id in &ids {
            state.waits.remove(id);
            state.index.remove(id);
            state.pending.remove(id);
            state.closed.remove(id);
        }
        log::trace!(
            "Forgot {} wait ids of plan execution {}",
            ids.len(),
            plan_execution_id
        );
        ids.len()
    }

    /// Correlation ids, parked responses and closed ids currently held.
    pub fn tracked(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.index.len(), state.pending.len(), state.closed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_completes_only_when_all_reported() {
        let waiter = WaitNotifyEngine::new();
        assert!(waiter.wait_for_all("pe-1", "fork", ids(&["a", "b", "c"])).is_none());

        assert!(waiter.notify("a", NotifyResponse::new(Status::Succeeded)).is_none());
        assert!(waiter.notify("c", NotifyResponse::new(Status::Failed)).is_none());
        assert_eq!(waiter.missing("fork"), ids(&["b"]));

        let done = waiter
            .notify("b", NotifyResponse::new(Status::Succeeded))
            .unwrap();
        assert_eq!(done.waiting_node_id, "fork");
        assert_eq!(done.responses.len(), 3);
        assert_eq!(done.responses["c"].status, Status::Failed);
        assert!(!waiter.is_waiting("fork"));
    }

    #[test]
    fn test_duplicates_never_complete_twice() {
        let waiter = WaitNotifyEngine::new();
        waiter.wait_for_all("pe-1", "fork", ids(&["a", "b"]));

        assert!(waiter.notify("a", NotifyResponse::new(Status::Succeeded)).is_none());
        assert!(waiter.notify("a", NotifyResponse::new(Status::Succeeded)).is_none());
        assert!(waiter.notify("b", NotifyResponse::new(Status::Succeeded)).is_some());
        assert!(waiter.notify("b", NotifyResponse::new(Status::Succeeded)).is_none());
        assert!(waiter.notify("a", NotifyResponse::new(Status::Succeeded)).is_none());
    }

    #[test]
    fn test_early_responses_are_parked() {
        let waiter = WaitNotifyEngine::new();
        assert!(waiter.notify("task-1", NotifyResponse::new(Status::Succeeded)).is_none());

        let done = waiter.wait_for_all("pe-1", "step", ids(&["task-1"])).unwrap();
        assert_eq!(done.responses["task-1"].status, Status::Succeeded);
    }

    #[test]
    fn test_cancel_closes_ids() {
        let waiter = WaitNotifyEngine::new();
        waiter.wait_for_all("pe-1", "section", ids(&["child"]));
        assert!(waiter.cancel("section"));
        assert!(!waiter.cancel("section"));
        assert!(waiter.notify("child", NotifyResponse::new(Status::Aborted)).is_none());
        assert!(waiter.missing("section").is_empty());
    }

    #[test]
    fn test_forget_plan_releases_its_ids() {
        let waiter = WaitNotifyEngine::new();
        waiter.wait_for_all("pe-1", "fork", ids(&["a", "b"]));
        waiter.wait_for_all("pe-2", "stage", ids(&["child-pe"]));
        waiter.notify("a", NotifyResponse::new(Status::Succeeded));
        waiter.notify("b", NotifyResponse::new(Status::Succeeded));
        waiter.notify_in("pe-1", "barrier-node", NotifyResponse::new(Status::Succeeded));
        assert_eq!(waiter.tracked(), (1, 1, 2));

        assert_eq!(waiter.forget_plan("pe-1"), 4);
        assert_eq!(waiter.tracked(), (1, 0, 0));
        assert_eq!(waiter.forget_plan("pe-1"), 0);

        waiter.cancel("stage");
        assert_eq!(waiter.tracked(), (0, 0, 1));
        waiter.forget_plan("pe-2");
        assert_eq!(waiter.tracked(), (0, 0, 0));
        assert!(!waiter.is_waiting("stage"));
    }

    #[test]
    fn test_unclaimed_notifications_are_capped() {
        let waiter = WaitNotifyEngine::new();
        for i in 0..MAX_UNATTRIBUTED_PARKED + 10 {
            waiter.notify(&format!("task-{}", i), NotifyResponse::new(Status::Succeeded));
        }
        assert_eq!(waiter.tracked().1, MAX_UNATTRIBUTED_PARKED);
        assert!(waiter
            .wait_for_all("pe-1", "step", ids(&["task-0"]))
            .is_none());
        let newest = format!("task-{}", MAX_UNATTRIBUTED_PARKED + 9);
        let done = waiter
            .wait_for_all("pe-1", "late", ids(&[newest.as_str()]))
            .unwrap();
        assert_eq!(done.waiting_node_id, "late");
    }

    #[test]
    fn test_response_serializes_camel_case() {
        let response = NotifyResponse::new(Status::Failed)
            .with_failure(FailureInfo::new("boom"))
            .with_identifier("shell");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["failureInfo"]["errorMessage"], "boom");
    }
}
