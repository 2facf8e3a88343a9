//! Plan execution records and their store

use std::sync::Arc;

use async_trait::async_trait;
use pipeline_contracts::{Ambiance, FailureInfo, Status};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::persistence::{update_with_retries, Versioned, VersionedMap, VersionedStore};

/// The node that launched a chained child plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentPlanInfo {
    pub plan_execution_id: String,
    pub node_execution_id: String,
}

/// Runtime record of one run of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExecution {
    pub uuid: String,
    pub plan_id: String,
    pub status: Status,
    /// Root ambiance, without levels
    pub ambiance: Ambiance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentPlanInfo>,
    /// Set while the rollback section runs
    #[serde(default)]
    pub rollback_mode: bool,
    /// Status the plan reached before rollback started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_rollback_status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    pub start_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<i64>,
    #[serde(default)]
    pub version: u64,
}

impl PlanExecution {
    pub fn running(ambiance: Ambiance, parent: Option<ParentPlanInfo>) -> Self {
        Self {
            uuid: ambiance.plan_execution_id.clone(),
            plan_id: ambiance.plan_id.clone(),
            status: Status::Running,
            ambiance,
            parent,
            rollback_mode: false,
            pre_rollback_status: None,
            failure_info: None,
            start_ts: crate::now_millis(),
            end_ts: None,
            version: 0,
        }
    }
}

impl Versioned for PlanExecution {
    const KIND: &'static str = "PlanExecution";

    fn id(&self) -> &str {
        &self.uuid
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

#[async_trait]
pub trait PlanExecutionStore: VersionedStore<PlanExecution> {
    /// Chained plans launched from nodes of `parent_plan_execution_id`.
    async fn find_child_plans(&self, parent_plan_execution_id: &str)
        -> Result<Vec<PlanExecution>>;
}

pub type InMemoryPlanExecutionStore = VersionedMap<PlanExecution>;

#[async_trait]
impl PlanExecutionStore for VersionedMap<PlanExecution> {
    async fn find_child_plans(
        &self,
        parent_plan_execution_id: &str,
    ) -> Result<Vec<PlanExecution>> {
        Ok(self.find(|p| {
            p.parent
                .as_ref()
                .is_some_and(|parent| parent.plan_execution_id == parent_plan_execution_id)
        }))
    }
}

/// Optimistic write path for plan executions.
pub struct PlanExecutionService {
    store: Arc<dyn PlanExecutionStore>,
    max_update_retries: u32,
}

impl PlanExecutionService {
    pub fn new(store: Arc<dyn PlanExecutionStore>, max_update_retries: u32) -> Self {
        Self {
            store,
            max_update_retries,
        }
    }

    pub async fn save(&self, plan_execution: PlanExecution) -> Result<PlanExecution> {
        self.store.insert(plan_execution).await
    }

    pub async fn get(&self, id: &str) -> Result<PlanExecution> {
        self.store.get(id).await
    }

    /// `None` if the plan execution does not exist.
    pub async fn find(&self, id: &str) -> Result<Option<PlanExecution>> {
        match self.store.get(id).await {
            Ok(plan_execution) => Ok(Some(plan_execution)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn update<M>(&self, id: &str, mut mutator: M) -> Result<PlanExecution>
    where
        M: FnMut(&mut PlanExecution) + Send,
    {
        update_with_retries(self.store.as_ref(), id, self.max_update_retries, |p| {
            mutator(p);
            true
        })
        .await?
        .ok_or_else(|| EngineError::not_found("PlanExecution", id))
    }

    /// Checked status change; `None` when the transition is not allowed.
    pub async fn update_status<M>(
        &self,
        id: &str,
        to: Status,
        mut ops: M,
    ) -> Result<Option<PlanExecution>>
    where
        M: FnMut(&mut PlanExecution) + Send,
    {
        let updated = update_with_retries(self.store.as_ref(), id, self.max_update_retries, |p| {
            if !p.status.can_transition_to(to) {
                return false;
            }
            p.status = to;
            if to.is_final() {
                p.end_ts = Some(crate::now_millis());
            }
            ops(p);
            true
        })
        .await?;
        if updated.is_some() {
            log::info!("Plan execution {} -> {}", id, to);
        } else {
            log::debug!("Ignoring transition of plan execution {} to {}", id, to);
        }
        Ok(updated)
    }

    pub async fn find_child_plans(&self, parent_plan_execution_id: &str) -> Result<Vec<PlanExecution>> {
        self.store.find_child_plans(parent_plan_execution_id).await
    }
}
