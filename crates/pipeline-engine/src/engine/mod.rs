//! Orchestration engine
//!
//! Drives plan executions through the node state machine. The engine never
//! calls itself across a suspension point: starting a node, resuming it
//! after its callbacks arrived, launching a chained plan and applying an
//! interrupt are all messages, handled by the listeners in this module.
//!
//! # Flow
//!
//! 1. [`OrchestrationEngine::start_plan`] creates the plan execution and
//!    queues the start node.
//! 2. A queued node is started, facilitated into its executable contract
//!    and dispatched. Sync steps finish in place, every other contract
//!    suspends the node on a set of correlation ids.
//! 3. Callbacks arrive through [`OrchestrationEngine::notify`]. Once every
//!    expected id has reported, a resume message is published.
//! 4. A finished step is advised. The advice decides whether the node
//!    moves on, retries, waits for an intervention or ends the plan.
//! 5. A concluded node notifies whoever waits on it. The last node of the
//!    top level chain ends the plan execution.

mod advice;
mod barriers;
mod builder;
mod dispatch;
mod interrupts;
mod listeners;
mod runtime;

pub use builder::EngineBuilder;
pub use listeners::{InterruptListener, NodeStatusListener, OrchestrationListener};
pub use runtime::OrchestrationRuntime;

use std::collections::BTreeMap;
use std::sync::Arc;

use pipeline_contracts::{Ambiance, FailureInfo, Level, Status};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::advise::AdviseChain;
use crate::barrier::BarrierService;
use crate::codec::{self, Codec};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{
    EventCategory, EventProducer, NodeResumeEvent, NodeStartEvent, NodeStatusUpdateEvent,
    StartChildPlanEvent,
};
use crate::execution::{
    ExecutionArchive, NodeExecution, NodeExecutionService, ParentPlanInfo, PlanExecution,
    PlanExecutionService,
};
use crate::interrupt::{
    Interrupt, InterruptManager, InterruptRequest, InterruptType, IssuedBy, TimeoutScheduler,
};
use crate::outputs::SweepingOutputStore;
use crate::plan::{Plan, PlanNode, PlanStore};
use crate::steps::Facilitator;
use crate::task::TaskDispatcher;
use crate::waiter::{CompletedWait, NotifyResponse, WaitNotifyEngine};

/// Correlation target of a new node execution.
enum NotifyTarget {
    /// Report under the node's own runtime id
    Own,
    Inherited(Option<String>),
}

/// Where a new node execution hangs in the execution tree.
struct NodeLinks {
    parent_id: Option<String>,
    previous_id: Option<String>,
    notify: NotifyTarget,
    retry_ids: Vec<String>,
}

impl NodeLinks {
    /// First node of a plan execution or of its rollback section.
    fn root() -> Self {
        Self {
            parent_id: None,
            previous_id: None,
            notify: NotifyTarget::Inherited(None),
            retry_ids: Vec::new(),
        }
    }

    fn child_of(parent: &NodeExecution) -> Self {
        Self {
            parent_id: Some(parent.uuid.clone()),
            previous_id: None,
            notify: NotifyTarget::Own,
            retry_ids: Vec::new(),
        }
    }

    /// Next node of the same chain. Reports wherever `previous` reported.
    fn after(previous: &NodeExecution) -> Self {
        Self {
            parent_id: previous.parent_id.clone(),
            previous_id: Some(previous.uuid.clone()),
            notify: NotifyTarget::Inherited(previous.notify_id.clone()),
            retry_ids: Vec::new(),
        }
    }

    fn retry_of(previous: &NodeExecution) -> Self {
        let mut retry_ids = previous.retry_ids.clone();
        retry_ids.push(previous.uuid.clone());
        Self {
            retry_ids,
            ..Self::after(previous)
        }
    }
}

/// The orchestration engine. Shared behind an `Arc` by the listeners.
pub struct OrchestrationEngine {
    config: EngineConfig,
    codec: Arc<dyn Codec>,
    plans: Arc<PlanStore>,
    nodes: Arc<NodeExecutionService>,
    plan_executions: Arc<PlanExecutionService>,
    interrupts: Arc<InterruptManager>,
    timeouts: TimeoutScheduler,
    barriers: BarrierService,
    waiter: WaitNotifyEngine,
    outputs: Arc<SweepingOutputStore>,
    advise: AdviseChain,
    facilitator: Facilitator,
    tasks: Arc<dyn TaskDispatcher>,
    producer: Arc<dyn EventProducer>,
    archive: ExecutionArchive,
}

impl OrchestrationEngine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn plans(&self) -> &Arc<PlanStore> {
        &self.plans
    }

    pub fn node_executions(&self) -> &Arc<NodeExecutionService> {
        &self.nodes
    }

    pub fn plan_executions(&self) -> &Arc<PlanExecutionService> {
        &self.plan_executions
    }

    pub fn interrupts(&self) -> &Arc<InterruptManager> {
        &self.interrupts
    }

    pub fn outputs(&self) -> &Arc<SweepingOutputStore> {
        &self.outputs
    }

    pub fn archive(&self) -> &ExecutionArchive {
        &self.archive
    }

    pub fn waiter(&self) -> &WaitNotifyEngine {
        &self.waiter
    }

    pub fn timeouts(&self) -> &TimeoutScheduler {
        &self.timeouts
    }

    /// Validate and store a plan so it can be started by id.
    pub fn register_plan(&self, plan: Plan) -> Result<Arc<Plan>> {
        plan.validate()?;
        self.plans.insert_plan(plan)
    }

    /// Start a new execution of a stored plan.
    pub async fn start_plan(
        &self,
        plan_id: &str,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Result<PlanExecution> {
        let plan = self.plans.get_plan(plan_id)?;
        let mut ambiance = Ambiance::new(uuid::Uuid::new_v4().to_string(), plan_id);
        ambiance.setup_abstractions = setup_abstractions;

        let plan_execution = self
            .plan_executions
            .save(PlanExecution::running(ambiance, None))
            .await?;
        self.launch(&plan_execution, &plan).await?;
        log::info!(
            "Started plan execution {} of plan '{}'",
            plan_execution.uuid,
            plan.name
        );
        Ok(plan_execution)
    }

    /// Register an interrupt against a running plan execution.
    pub async fn register_interrupt(&self, request: InterruptRequest) -> Result<Interrupt> {
        self.interrupts.register(request).await
    }

    /// Deliver a callback for `correlation_id`. Returns `true` when it
    /// completed a wait and the waiting node was scheduled to resume.
    pub async fn notify(&self, correlation_id: &str, response: NotifyResponse) -> Result<bool> {
        let completed = self.waiter.notify(correlation_id, response);
        self.resume_completed(completed).await
    }

    /// Deliver a callback raised inside `plan_execution_id`.
    async fn notify_in(
        &self,
        plan_execution_id: &str,
        correlation_id: &str,
        response: NotifyResponse,
    ) -> Result<bool> {
        let completed = self
            .waiter
            .notify_in(plan_execution_id, correlation_id, response);
        self.resume_completed(completed).await
    }

    async fn resume_completed(&self, completed: Option<CompletedWait>) -> Result<bool> {
        match completed {
            Some(completed) => {
                self.publish_resume(completed).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Launch a chained plan requested by a pipeline stage.
    ///
    /// The child plan execution is persisted before the parent is checked
    /// for an abort, so an ABORT_ALL racing with the launch either sees the
    /// child when it cascades or is seen here. A redelivery after a failed
    /// launch picks up where the launch stopped.
    pub async fn start_child_plan(&self, event: StartChildPlanEvent) -> Result<bool> {
        let plan = self.plans.get_plan(&event.plan_id)?;
        let child = match self.plan_executions.find(&event.plan_execution_id).await? {
            Some(child) => match self.resume_child_launch(&child, &plan).await? {
                Some(done) => return Ok(done),
                None => child,
            },
            None => {
                let parent = self
                    .plan_executions
                    .get(&event.parent_plan_execution_id)
                    .await?;
                let mut ambiance =
                    Ambiance::new(event.plan_execution_id.clone(), event.plan_id.clone());
                ambiance.setup_abstractions = parent.ambiance.setup_abstractions.clone();
                self.plan_executions
                    .save(PlanExecution::running(
                        ambiance,
                        Some(ParentPlanInfo {
                            plan_execution_id: event.parent_plan_execution_id.clone(),
                            node_execution_id: event.parent_node_execution_id.clone(),
                        }),
                    ))
                    .await?
            }
        };

        if self.parent_is_aborting(&event).await? {
            log::warn!(
                "Parent plan execution {} is aborting, aborting chained plan execution {} before it starts",
                event.parent_plan_execution_id,
                child.uuid
            );
            self.interrupts
                .register(InterruptRequest::new(
                    InterruptType::AbortAll,
                    child.uuid.clone(),
                    IssuedBy::System,
                ))
                .await?;
            return Ok(true);
        }

        self.launch(&child, &plan).await?;
        log::info!(
            "Started chained plan execution {} of plan '{}' for node {}",
            child.uuid,
            plan.name,
            event.parent_node_execution_id
        );
        Ok(true)
    }

    /// Decide what a redelivered launch of an existing child still has to do.
    /// `None` means nothing was launched yet.
    async fn resume_child_launch(&self, child: &PlanExecution, plan: &Plan) -> Result<Option<bool>> {
        let aborted = self
            .interrupts
            .fetch_for_plan(&child.uuid)
            .await?
            .iter()
            .any(|i| i.interrupt_type == InterruptType::AbortAll);
        if child.status.is_final() || aborted {
            log::debug!("Chained plan execution {} already launched", child.uuid);
            return Ok(Some(false));
        }

        let nodes = self.nodes.find_by_plan_execution_id(&child.uuid).await?;
        if nodes.is_empty() {
            log::warn!(
                "Chained plan execution {} was saved but never launched, launching it",
                child.uuid
            );
            return Ok(None);
        }

        // The start node may be saved without its start having been announced.
        let mut announced = false;
        for node in nodes.iter().filter(|n| {
            n.status == Status::Queued && n.parent_id.is_none() && n.plan_node_id == plan.start_node_id
        }) {
            log::info!(
                "Announcing start node {} of chained plan execution {} again",
                node.uuid,
                child.uuid
            );
            let event = NodeStartEvent {
                node_execution_id: node.uuid.clone(),
            };
            self.publish(&node.ambiance, EventCategory::NodeStart, &event, false)
                .await?;
            announced = true;
        }
        Ok(Some(announced))
    }

    async fn parent_is_aborting(&self, event: &StartChildPlanEvent) -> Result<bool> {
        let parent = self
            .plan_executions
            .get(&event.parent_plan_execution_id)
            .await?;
        if parent.status == Status::Aborted {
            return Ok(true);
        }
        let pending = self
            .interrupts
            .fetch_active(&event.parent_plan_execution_id, InterruptType::AbortAll)
            .await?;
        if !pending.is_empty() {
            return Ok(true);
        }
        let parent_node = self.nodes.get(&event.parent_node_execution_id).await?;
        Ok(parent_node.status == Status::Aborted || parent_node.status == Status::Discontinuing)
    }

    async fn launch(&self, plan_execution: &PlanExecution, plan: &Plan) -> Result<()> {
        self.barriers.initialize(&plan_execution.uuid, plan).await?;
        let start = plan.node(&plan.start_node_id)?;
        let node = self.prepare_node(&plan_execution.ambiance, start, NodeLinks::root());
        self.queue_node(node, 0).await?;
        Ok(())
    }

    fn plan_node_of(&self, node: &NodeExecution) -> Result<(Arc<Plan>, PlanNode)> {
        let plan = self.plans.get_plan(&node.ambiance.plan_id)?;
        let plan_node = plan.node(&node.plan_node_id)?.clone();
        Ok((plan, plan_node))
    }

    /// Build a queued execution of `plan_node` below `base`.
    fn prepare_node(&self, base: &Ambiance, plan_node: &PlanNode, links: NodeLinks) -> NodeExecution {
        let runtime_id = uuid::Uuid::new_v4().to_string();
        let mut level = Level::new(
            runtime_id,
            plan_node.uuid.clone(),
            plan_node.identifier.clone(),
            plan_node.step_type.clone(),
        )
        .with_retry_index(links.retry_ids.len() as u32)
        .with_start_ts(crate::now_millis());
        if let Some(group) = &plan_node.group {
            level = level.with_group(group.clone());
        }

        let mut node = NodeExecution::queued(base.clone_for_child(level), plan_node);
        node.parent_id = links.parent_id;
        node.previous_id = links.previous_id;
        node.notify_id = match links.notify {
            NotifyTarget::Own => Some(node.uuid.clone()),
            NotifyTarget::Inherited(id) => id,
        };
        node.retry_ids = links.retry_ids;
        node
    }

    /// Persist a queued node and publish its start, optionally after
    /// `delay_ms`.
    async fn queue_node(&self, node: NodeExecution, delay_ms: u64) -> Result<NodeExecution> {
        let node = self.nodes.save(node).await?;
        if let Some(previous_id) = &node.previous_id {
            let next_id = node.uuid.clone();
            self.nodes
                .update(previous_id, |previous| previous.next_id = Some(next_id.clone()))
                .await?;
        }

        let event = NodeStartEvent {
            node_execution_id: node.uuid.clone(),
        };
        if delay_ms == 0 {
            self.publish(&node.ambiance, EventCategory::NodeStart, &event, false)
                .await?;
            return Ok(node);
        }

        let category = EventCategory::NodeStart;
        let payload = codec::encode(self.codec.as_ref(), category.as_str(), &event)?;
        let producer = self.producer.clone();
        let ambiance = node.ambiance.clone();
        log::debug!("Starting node {} in {}ms", node.uuid, delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            if let Err(e) = producer
                .send_event(&ambiance, payload, category, category.topic(), false)
                .await
            {
                log::error!(
                    "Failed to publish delayed start of {}: {}",
                    ambiance.current_runtime_id().unwrap_or_default(),
                    e
                );
            }
        });
        Ok(node)
    }

    /// Move a node to `to` and announce the change on the status topic.
    async fn set_status<M>(&self, id: &str, to: Status, ops: M) -> Result<Option<NodeExecution>>
    where
        M: FnMut(&mut NodeExecution) + Send,
    {
        let updated = self.nodes.update_status(id, to, ops).await?;
        if let Some(node) = &updated {
            self.publish_status(node).await?;
        }
        Ok(updated)
    }

    async fn set_status_from<M>(
        &self,
        id: &str,
        from: &[Status],
        to: Status,
        ops: M,
    ) -> Result<Option<NodeExecution>>
    where
        M: FnMut(&mut NodeExecution) + Send,
    {
        let updated = self.nodes.update_status_from(id, from, to, ops).await?;
        if let Some(node) = &updated {
            self.publish_status(node).await?;
        }
        Ok(updated)
    }

    async fn publish_status(&self, node: &NodeExecution) -> Result<()> {
        let event = NodeStatusUpdateEvent {
            plan_execution_id: node.plan_execution_id().to_string(),
            node_execution_id: node.uuid.clone(),
            plan_node_id: node.plan_node_id.clone(),
            status: node.status,
            group: node.group.clone(),
            step_type: node.step_type.clone(),
        };
        self.publish(&node.ambiance, EventCategory::NodeStatusUpdate, &event, true)
            .await?;
        Ok(())
    }

    async fn publish_resume(&self, completed: CompletedWait) -> Result<()> {
        let node = self.nodes.get(&completed.waiting_node_id).await?;
        let event = NodeResumeEvent {
            node_execution_id: completed.waiting_node_id,
            responses: completed.responses,
        };
        self.publish(&node.ambiance, EventCategory::NodeResume, &event, false)
            .await?;
        Ok(())
    }

    async fn publish<T: Serialize + Sync>(
        &self,
        ambiance: &Ambiance,
        category: EventCategory,
        payload: &T,
        ordered: bool,
    ) -> Result<String> {
        let bytes = codec::encode(self.codec.as_ref(), category.as_str(), payload)?;
        self.producer
            .send_event(ambiance, bytes, category, category.topic(), ordered)
            .await
    }

    /// Decode a message payload published under `category`.
    pub fn decode<T: DeserializeOwned>(&self, category: EventCategory, payload: &[u8]) -> Result<T> {
        codec::decode(self.codec.as_ref(), category.as_str(), payload)
    }

    /// Report a concluded node to whoever waits on it, or end the plan when
    /// it was the last node of the top level chain.
    async fn conclude(&self, node: &NodeExecution) -> Result<bool> {
        self.timeouts.cancel_for_node(&node.uuid);
        match &node.notify_id {
            Some(notify_id) => {
                let mut response = NotifyResponse::new(node.status).with_identifier(&node.identifier);
                response.failure_info = node.failure_info.clone();
                response.outcomes = node.outcomes.clone();
                self.notify_in(node.plan_execution_id(), notify_id, response)
                    .await
            }
            None => {
                self.end_plan(node.plan_execution_id(), node.status, node.failure_info.clone())
                    .await
            }
        }
    }

    /// Finish a plan execution.
    ///
    /// A broke plan whose pipeline rollback was requested runs its rollback
    /// section first and keeps the status it failed with.
    async fn end_plan(
        &self,
        plan_execution_id: &str,
        status: Status,
        failure_info: Option<FailureInfo>,
    ) -> Result<bool> {
        let plan_execution = self.plan_executions.get(plan_execution_id).await?;
        if plan_execution.status.is_final() {
            log::debug!(
                "Plan execution {} already ended with {}",
                plan_execution_id,
                plan_execution.status
            );
            return Ok(false);
        }

        if self.start_rollback(&plan_execution, status, &failure_info).await? {
            return Ok(true);
        }

        let (final_status, failure_info) = if plan_execution.rollback_mode {
            // An abort during rollback wins over the status that triggered it.
            let final_status = match plan_execution.pre_rollback_status {
                Some(pre_rollback) if status != Status::Aborted => pre_rollback,
                _ => status,
            };
            (
                final_status,
                plan_execution.failure_info.clone().or(failure_info),
            )
        } else if status.is_positive() {
            (Status::Succeeded, None)
        } else {
            (status, failure_info)
        };

        let Some(ended) = self
            .plan_executions
            .update_status(plan_execution_id, final_status, |pe| {
                pe.failure_info = failure_info.clone();
            })
            .await?
        else {
            return Ok(false);
        };

        if self.config.archive_completed_plans {
            let nodes = self.nodes.find_by_plan_execution_id(plan_execution_id).await?;
            self.archive.archive(plan_execution_id, &nodes)?;
        }
        self.outputs.clear(plan_execution_id);
        self.waiter.forget_plan(plan_execution_id);

        if let Some(parent) = &ended.parent {
            log::debug!(
                "Reporting chained plan execution {} to node {}",
                ended.uuid,
                parent.node_execution_id
            );
            let mut response = NotifyResponse::new(final_status);
            response.failure_info = failure_info;
            self.notify_in(&parent.plan_execution_id, &ended.uuid, response)
                .await?;
        }
        Ok(true)
    }

    async fn start_rollback(
        &self,
        plan_execution: &PlanExecution,
        status: Status,
        failure_info: &Option<FailureInfo>,
    ) -> Result<bool> {
        if plan_execution.rollback_mode || !status.is_broke() || status == Status::Aborted {
            return Ok(false);
        }
        if !self.outputs.resolve_flag(
            &plan_execution.ambiance,
            crate::outputs::USE_PIPELINE_ROLLBACK_STRATEGY,
        ) {
            return Ok(false);
        }
        let plan = self.plans.get_plan(&plan_execution.plan_id)?;
        let Some(rollback_node_id) = plan.rollback_node_id.clone() else {
            log::warn!(
                "Pipeline rollback requested for plan execution {} but plan '{}' has no rollback section",
                plan_execution.uuid,
                plan.name
            );
            return Ok(false);
        };

        self.plan_executions
            .update(&plan_execution.uuid, |pe| {
                pe.rollback_mode = true;
                pe.pre_rollback_status = Some(status);
                pe.failure_info = failure_info.clone();
            })
            .await?;
        log::warn!(
            "Plan execution {} ended {}, running rollback section '{}'",
            plan_execution.uuid,
            status,
            rollback_node_id
        );
        let rollback = plan.node(&rollback_node_id)?;
        let node = self.prepare_node(&plan_execution.ambiance, rollback, NodeLinks::root());
        self.queue_node(node, 0).await?;
        Ok(true)
    }

    /// Stale messages reference records that are gone. They are dropped,
    /// never redelivered.
    fn drop_stale(result: Result<bool>) -> Result<bool> {
        match result {
            Err(EngineError::NotFound { kind, id }) => {
                log::warn!("Dropping message for missing {} {}", kind, id);
                Ok(false)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{topics, InMemoryEventBus};
    use crate::executable::ExecutableResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::plan::PlanBuilder;
    use pipeline_contracts::{groups, step_types, FacilitatorType, StepType};
    use serde_json::json;

    fn engine() -> (OrchestrationEngine, Arc<InMemoryEventBus>) {
        let bus = Arc::new(InMemoryEventBus::new());
        let engine = EngineBuilder::new(EngineConfig::default())
            .build(bus.clone())
            .unwrap();
        (engine, bus)
    }

    fn stage_plan(id: &str) -> Plan {
        PlanBuilder::new(id, "Deploy")
            .add_node(
                "stage",
                "deploy",
                StepType::step(step_types::SECTION),
                FacilitatorType::Child,
            )
            .with_group(groups::STAGE)
            .with_parameters(json!({"childNodeId": "fork"}))
            .add_node(
                "fork",
                "parallel",
                StepType::step(step_types::FORK),
                FacilitatorType::Children,
            )
            .with_parameters(json!({"childNodeIds": ["gate"]}))
            .add_node(
                "gate",
                "gate",
                StepType::step(step_types::BARRIER),
                FacilitatorType::Async,
            )
            .with_group(groups::STEP)
            .with_parameters(json!({"barrierRef": "gate"}))
            .build()
    }

    async fn queued_root(
        engine: &OrchestrationEngine,
        bus: &InMemoryEventBus,
    ) -> (NodeExecution, tokio::sync::mpsc::UnboundedReceiver<crate::events::Message>) {
        let mut rx = bus.subscribe(topics::ORCHESTRATION).unwrap();
        engine.register_plan(stage_plan("p")).unwrap();
        let pe = engine.start_plan("p", BTreeMap::new()).await.unwrap();
        assert_eq!(pe.status, Status::Running);

        let message = rx.recv().await.unwrap();
        let event: NodeStartEvent = engine
            .decode(EventCategory::NodeStart, &message.payload)
            .unwrap();
        let root = engine.node_executions().get(&event.node_execution_id).await.unwrap();
        (root, rx)
    }

    #[tokio::test]
    async fn test_start_plan_queues_root_node() {
        let (engine, bus) = engine();
        let (root, _rx) = queued_root(&engine, &bus).await;

        assert_eq!(root.status, Status::Queued);
        assert_eq!(root.plan_node_id, "stage");
        assert!(root.parent_id.is_none());
        assert!(root.notify_id.is_none());
        assert_eq!(root.ambiance.depth(), 1);
        assert_eq!(root.ambiance.current_group(), Some(groups::STAGE));
        assert_eq!(root.ambiance.current_runtime_id(), Some(root.uuid.as_str()));
    }

    #[tokio::test]
    async fn test_child_reports_under_own_runtime_id() {
        let (engine, bus) = engine();
        let (root, _rx) = queued_root(&engine, &bus).await;

        assert!(engine.start_node(&root.uuid).await.unwrap());
        let root = engine.node_executions().get(&root.uuid).await.unwrap();
        assert_eq!(root.status, Status::AsyncWaiting);
        assert!(root.resolved_step_parameters.is_some());
        let Some(ExecutableResponse::Child { child_runtime_id }) = root.executable_responses.first()
        else {
            panic!("expected a child response, got {:?}", root.executable_responses);
        };

        let child = engine.node_executions().get(child_runtime_id).await.unwrap();
        assert_eq!(child.status, Status::Queued);
        assert_eq!(child.parent_id.as_deref(), Some(root.uuid.as_str()));
        assert_eq!(child.notify_id.as_deref(), Some(child.uuid.as_str()));
        assert_eq!(child.ambiance.depth(), 2);
        assert_eq!(child.ambiance.parent_runtime_id(), Some(root.uuid.as_str()));
        assert!(engine.waiter().is_waiting(&root.uuid));
    }

    #[tokio::test]
    async fn test_redelivered_start_is_ignored() {
        let (engine, bus) = engine();
        let (root, _rx) = queued_root(&engine, &bus).await;

        assert!(engine.start_node(&root.uuid).await.unwrap());
        assert!(!engine.start_node(&root.uuid).await.unwrap());
        let root = engine.node_executions().get(&root.uuid).await.unwrap();
        assert_eq!(root.executable_responses.len(), 1);
    }

    #[tokio::test]
    async fn test_chained_plan_of_aborting_parent_never_starts() {
        let (engine, bus) = engine();
        engine.register_plan(stage_plan("child")).unwrap();
        let (root, _rx) = queued_root(&engine, &bus).await;
        let parent_id = root.plan_execution_id().to_string();
        engine
            .register_interrupt(InterruptRequest::new(
                InterruptType::AbortAll,
                parent_id.clone(),
                IssuedBy::manual("ops"),
            ))
            .await
            .unwrap();

        let event = StartChildPlanEvent {
            parent_plan_execution_id: parent_id,
            parent_node_execution_id: root.uuid.clone(),
            plan_id: "child".into(),
            plan_execution_id: "child-pe".into(),
        };
        assert!(engine.start_child_plan(event.clone()).await.unwrap());
        // Redelivery finds the child already launched
        assert!(!engine.start_child_plan(event).await.unwrap());

        let child = engine.plan_executions().get("child-pe").await.unwrap();
        assert_eq!(child.parent.unwrap().node_execution_id, root.uuid);
        assert!(engine
            .node_executions()
            .find_by_plan_execution_id("child-pe")
            .await
            .unwrap()
            .is_empty());
        let interrupts = engine.interrupts().fetch_for_plan("child-pe").await.unwrap();
        assert_eq!(interrupts.len(), 1);
        assert_eq!(interrupts[0].interrupt_type, InterruptType::AbortAll);
        assert_eq!(interrupts[0].issued_by, IssuedBy::System);
    }

    /// Fails the first send after being armed.
    struct FailingOnce {
        bus: Arc<InMemoryEventBus>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl EventProducer for FailingOnce {
        async fn send_event(
            &self,
            ambiance: &Ambiance,
            payload: Vec<u8>,
            category: EventCategory,
            topic: &str,
            ordered: bool,
        ) -> Result<String> {
            if self.armed.swap(false, Ordering::SeqCst) {
                return Err(EngineError::Bus("broker unavailable".to_string()));
            }
            self.bus
                .send_event(ambiance, payload, category, topic, ordered)
                .await
        }
    }

    #[tokio::test]
    async fn test_chained_plan_start_survives_failed_launch() {
        let bus = Arc::new(InMemoryEventBus::new());
        let producer = Arc::new(FailingOnce {
            bus: bus.clone(),
            armed: AtomicBool::new(false),
        });
        let engine = EngineBuilder::new(EngineConfig::default())
            .build(producer.clone())
            .unwrap();
        let mut rx = bus.subscribe(topics::ORCHESTRATION).unwrap();
        engine.register_plan(stage_plan("p")).unwrap();
        engine.register_plan(stage_plan("child")).unwrap();
        let pe = engine.start_plan("p", BTreeMap::new()).await.unwrap();
        let first = rx.recv().await.unwrap();
        let root: NodeStartEvent = engine
            .decode(EventCategory::NodeStart, &first.payload)
            .unwrap();

        let event = StartChildPlanEvent {
            parent_plan_execution_id: pe.uuid.clone(),
            parent_node_execution_id: root.node_execution_id.clone(),
            plan_id: "child".into(),
            plan_execution_id: "child-pe".into(),
        };
        producer.armed.store(true, Ordering::SeqCst);
        assert!(engine.start_child_plan(event.clone()).await.is_err());
        assert!(engine.plan_executions().find("child-pe").await.unwrap().is_some());

        assert!(engine.start_child_plan(event).await.unwrap());
        let message = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let started: NodeStartEvent = engine
            .decode(EventCategory::NodeStart, &message.payload)
            .unwrap();
        let child_root = engine
            .node_executions()
            .get(&started.node_execution_id)
            .await
            .unwrap();
        assert_eq!(child_root.plan_execution_id(), "child-pe");
        assert_eq!(child_root.plan_node_id, "stage");
        assert_eq!(
            engine
                .node_executions()
                .find_by_plan_execution_id("child-pe")
                .await
                .unwrap()
                .len(),
            1
        );

        assert!(engine.start_node(&child_root.uuid).await.unwrap());
        assert_eq!(
            engine.node_executions().get(&child_root.uuid).await.unwrap().status,
            Status::AsyncWaiting
        );
    }

    #[test]
    fn test_missing_records_are_dropped() {
        let stale = OrchestrationEngine::drop_stale(Err(EngineError::not_found(
            "NodeExecution",
            "gone",
        )));
        assert!(!stale.unwrap());
        assert!(OrchestrationEngine::drop_stale(Err(EngineError::invalid("bad"))).is_err());
    }
}
