//! Node execution queries and optimistic updates

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use pipeline_contracts::Status;

use super::{NodeExecution, NodeExecutionStore};
use crate::error::{EngineError, Result};
use crate::persistence::update_with_retries;

/// The single write path for node executions.
///
/// Every mutation is an optimistic read-modify-replace; a version conflict
/// re-reads and re-applies the mutator up to `max_update_retries` times.
/// Status changes are checked against the transition graph, and a rejected
/// transition leaves the record untouched.
pub struct NodeExecutionService {
    store: Arc<dyn NodeExecutionStore>,
    max_update_retries: u32,
}

impl NodeExecutionService {
    pub fn new(store: Arc<dyn NodeExecutionStore>, max_update_retries: u32) -> Self {
        Self {
            store,
            max_update_retries,
        }
    }

    pub fn store(&self) -> &Arc<dyn NodeExecutionStore> {
        &self.store
    }

    pub async fn save(&self, node: NodeExecution) -> Result<NodeExecution> {
        log::trace!(
            "Saving node execution {} ({}) of plan execution {}",
            node.uuid,
            node.identifier,
            node.plan_execution_id()
        );
        self.store.insert(node).await
    }

    pub async fn get(&self, id: &str) -> Result<NodeExecution> {
        self.store.get(id).await
    }

    /// Apply `mutator` unconditionally.
    pub async fn update<M>(&self, id: &str, mut mutator: M) -> Result<NodeExecution>
    where
        M: FnMut(&mut NodeExecution) + Send,
    {
        update_with_retries(self.store.as_ref(), id, self.max_update_retries, |node| {
            mutator(node);
            node.last_updated_at = crate::now_millis();
            true
        })
        .await?
        .ok_or_else(|| EngineError::not_found("NodeExecution", id))
    }

    /// Move `id` to `to` and apply `ops` in the same write. Returns `None`
    /// when the current status may not move to `to`.
    pub async fn update_status<M>(
        &self,
        id: &str,
        to: Status,
        ops: M,
    ) -> Result<Option<NodeExecution>>
    where
        M: FnMut(&mut NodeExecution) + Send,
    {
        self.transition(id, None, to, ops).await
    }

    /// Like [`update_status`](Self::update_status), but only from one of
    /// `from`.
    pub async fn update_status_from<M>(
        &self,
        id: &str,
        from: &[Status],
        to: Status,
        ops: M,
    ) -> Result<Option<NodeExecution>>
    where
        M: FnMut(&mut NodeExecution) + Send,
    {
        self.transition(id, Some(from), to, ops).await
    }

    async fn transition<M>(
        &self,
        id: &str,
        from: Option<&[Status]>,
        to: Status,
        mut ops: M,
    ) -> Result<Option<NodeExecution>>
    where
        M: FnMut(&mut NodeExecution) + Send,
    {
        let mut rejected_from = None;
        let updated = update_with_retries(self.store.as_ref(), id, self.max_update_retries, |node| {
            let allowed = from.map_or(true, |f| f.contains(&node.status));
            if !allowed || !node.status.can_transition_to(to) {
                rejected_from = Some(node.status);
                return false;
            }
            let now = crate::now_millis();
            node.status = to;
            if to.is_final() {
                node.end_ts = Some(now);
            }
            node.last_updated_at = now;
            ops(node);
            true
        })
        .await?;

        match (&updated, rejected_from) {
            (Some(node), _) => log::debug!(
                "Node execution {} ({}) -> {}",
                node.uuid,
                node.identifier,
                to
            ),
            (None, Some(current)) => log::debug!(
                "Ignoring transition of node execution {} from {} to {}",
                id,
                current,
                to
            ),
            (None, None) => {}
        }
        Ok(updated)
    }

    pub async fn find_by_plan_execution_id(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<NodeExecution>> {
        self.store.find_by_plan_execution_id(plan_execution_id).await
    }

    /// Non-final nodes of a plan execution, old retries excluded.
    pub async fn active_nodes(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        Ok(self
            .find_by_plan_execution_id(plan_execution_id)
            .await?
            .into_iter()
            .filter(NodeExecution::is_active)
            .collect())
    }

    /// Descendants of `parent_id` (or every node of the plan execution when
    /// `None`) whose status is in `statuses`. Old retries are skipped.
    pub async fn find_all_children_with_status_in(
        &self,
        plan_execution_id: &str,
        parent_id: Option<&str>,
        statuses: &[Status],
        include_parent: bool,
    ) -> Result<Vec<NodeExecution>> {
        let all = self.find_by_plan_execution_id(plan_execution_id).await?;
        let selected: Vec<NodeExecution> = match parent_id {
            None => all,
            Some(root) => {
                let mut by_parent: HashMap<&str, Vec<&NodeExecution>> = HashMap::new();
                for node in &all {
                    if let Some(parent) = node.parent_id.as_deref() {
                        by_parent.entry(parent).or_default().push(node);
                    }
                }
                let mut ids: HashSet<String> = HashSet::new();
                if include_parent {
                    ids.insert(root.to_string());
                }
                let mut stack = vec![root];
                while let Some(current) = stack.pop() {
                    for child in by_parent.get(current).into_iter().flatten() {
                        if ids.insert(child.uuid.clone()) {
                            stack.push(child.uuid.as_str());
                        }
                    }
                }
                all.iter()
                    .filter(|n| ids.contains(&n.uuid))
                    .cloned()
                    .collect()
            }
        };
        Ok(selected
            .into_iter()
            .filter(|n| !n.old_retry && statuses.contains(&n.status))
            .collect())
    }

    /// Move every non-final node of a plan execution to `ERRORED`. Final
    /// nodes are untouched. Returns the number of nodes changed.
    pub async fn error_out_active_nodes(&self, plan_execution_id: &str) -> Result<usize> {
        let mut changed = 0;
        for node in self.active_nodes(plan_execution_id).await? {
            if self
                .update_status(&node.uuid, Status::Errored, |_| {})
                .await?
                .is_some()
            {
                changed += 1;
            }
        }
        if changed > 0 {
            log::warn!(
                "Errored out {} active nodes of plan execution {}",
                changed,
                plan_execution_id
            );
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::test_support::{child_of, node};
    use crate::execution::InMemoryNodeExecutionStore;

    async fn service_with(nodes: Vec<NodeExecution>) -> NodeExecutionService {
        let service = NodeExecutionService::new(Arc::new(InMemoryNodeExecutionStore::new()), 3);
        for n in nodes {
            service.save(n).await.unwrap();
        }
        service
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let service = service_with(Vec::new()).await;
        assert!(service.get("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_status_applies_ops_and_end_ts() {
        let service = service_with(vec![node("pe", "n1")]).await;
        service
            .update_status("n1", Status::Running, |_| {})
            .await
            .unwrap()
            .unwrap();
        let done = service
            .update_status("n1", Status::Succeeded, |n| {
                n.outcomes.insert("out".into(), serde_json::json!(1));
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, Status::Succeeded);
        assert!(done.end_ts.is_some());
        assert_eq!(done.outcomes["out"], 1);
        assert_eq!(done.version, 2);
    }

    #[tokio::test]
    async fn test_terminal_node_rejects_transition_untouched() {
        let service = service_with(vec![node("pe", "n1")]).await;
        service.update_status("n1", Status::Running, |_| {}).await.unwrap();
        service.update_status("n1", Status::Failed, |_| {}).await.unwrap();
        let before = service.get("n1").await.unwrap();

        let result = service
            .update_status("n1", Status::Running, |n| n.retry_ids.push("x".into()))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(service.get("n1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_update_status_from_guards_source() {
        let service = service_with(vec![node("pe", "n1")]).await;
        let result = service
            .update_status_from("n1", &[Status::Running], Status::AsyncWaiting, |_| {})
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(service.get("n1").await.unwrap().status, Status::Queued);
    }

    #[tokio::test]
    async fn test_find_all_children_recurses_and_skips_old_retries() {
        let root = node("pe", "stage");
        let fork = child_of(&root, "fork");
        let a = child_of(&fork, "a");
        let mut b_old = child_of(&fork, "b-old");
        b_old.old_retry = true;
        let b = child_of(&fork, "b");
        let other = node("pe", "other");
        let service = service_with(vec![root, fork, a, b_old, b, other]).await;

        let found = service
            .find_all_children_with_status_in("pe", Some("stage"), &[Status::Queued], false)
            .await
            .unwrap();
        let mut ids: Vec<_> = found.iter().map(|n| n.uuid.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "fork"]);

        let with_parent = service
            .find_all_children_with_status_in("pe", Some("fork"), &[Status::Queued], true)
            .await
            .unwrap();
        assert_eq!(with_parent.len(), 3);
    }

    #[tokio::test]
    async fn test_error_out_leaves_final_nodes() {
        let service = service_with(vec![node("pe", "done"), node("pe", "live")]).await;
        service.update_status("done", Status::Running, |_| {}).await.unwrap();
        service.update_status("done", Status::Succeeded, |_| {}).await.unwrap();

        assert_eq!(service.error_out_active_nodes("pe").await.unwrap(), 1);
        assert_eq!(service.get("done").await.unwrap().status, Status::Succeeded);
        assert_eq!(service.get("live").await.unwrap().status, Status::Errored);
    }

    #[tokio::test]
    async fn test_active_nodes_skip_old_retries() {
        let mut superseded = node("pe", "old");
        superseded.old_retry = true;
        let service = service_with(vec![superseded, node("pe", "new")]).await;
        let active = service.active_nodes("pe").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].uuid, "new");
    }
}
