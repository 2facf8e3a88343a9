//! Starting, dispatching and resuming node executions

use pipeline_contracts::{FailureInfo, FailureType, Status};

use super::{NodeLinks, OrchestrationEngine};
use crate::codec;
use crate::error::{EngineError, Result};
use crate::events::{EventCategory, StartChildPlanEvent};
use crate::executable::{Executable, ExecutableResponse, StepContext, StepResponse};
use crate::execution::NodeExecution;
use crate::plan::{Plan, PlanNode};
use crate::waiter::ResponseMap;

/// A step that returned an error instead of a response.
pub(super) fn error_response(error: &EngineError) -> StepResponse {
    let failure_type = match error {
        EngineError::InvalidArguments(_) | EngineError::Serialization(_) => {
            FailureType::UnknownFailure
        }
        _ => FailureType::ApplicationFailure,
    };
    let mut response = StepResponse::with_status(Status::Errored);
    response.failure_info =
        Some(FailureInfo::new(error.to_string()).with_failure_type(failure_type));
    response
}

impl OrchestrationEngine {
    /// Start a queued node. Anything not queued any more is a redelivery
    /// and is ignored.
    pub async fn start_node(&self, node_execution_id: &str) -> Result<bool> {
        let node = self.nodes.get(node_execution_id).await?;
        if node.status != Status::Queued {
            log::debug!(
                "Node {} is {}, ignoring start",
                node_execution_id,
                node.status
            );
            return Ok(false);
        }

        let plan_execution = self.plan_executions.get(node.plan_execution_id()).await?;
        if plan_execution.status.is_final() {
            log::debug!(
                "Plan execution {} already {}, skipping node {}",
                plan_execution.uuid,
                plan_execution.status,
                node.uuid
            );
            self.set_status_from(&node.uuid, &[Status::Queued], Status::Skipped, |_| {})
                .await?;
            return Ok(false);
        }
        if plan_execution.status == Status::Paused {
            log::info!("Plan execution {} paused, parking node {}", plan_execution.uuid, node.uuid);
            self.set_status_from(&node.uuid, &[Status::Queued], Status::Paused, |_| {})
                .await?;
            return Ok(true);
        }

        let (plan, plan_node) = self.plan_node_of(&node)?;
        let executable = match self.facilitator.resolve(&plan_node) {
            Ok(executable) => executable,
            Err(e) => {
                log::error!("Cannot facilitate node {} ({}): {}", node.uuid, node.identifier, e);
                return self.process_step_response(&node.uuid, error_response(&e)).await;
            }
        };

        let resolved = codec::encode(
            self.codec.as_ref(),
            &plan_node.step_type.type_name,
            &plan_node.step_parameters,
        )?;
        let Some(node) = self
            .set_status_from(&node.uuid, &[Status::Queued], Status::Running, |n| {
                n.resolved_step_parameters = Some(resolved.clone());
            })
            .await?
        else {
            return Ok(false);
        };
        log::debug!(
            "Running node {} ({}) as {}",
            node.uuid,
            node.identifier,
            executable.facilitator_type()
        );

        let ctx = Self::step_context(&node, &plan_node);
        self.dispatch(node, &plan, executable, ctx).await
    }

    fn step_context(node: &NodeExecution, plan_node: &PlanNode) -> StepContext {
        StepContext {
            node_execution_id: node.uuid.clone(),
            ambiance: node.ambiance.clone(),
            parameters: plan_node.step_parameters.clone(),
        }
    }

    async fn dispatch(
        &self,
        node: NodeExecution,
        plan: &Plan,
        executable: Executable,
        ctx: StepContext,
    ) -> Result<bool> {
        match executable {
            Executable::Sync(step) => {
                let response = step
                    .execute_sync(&ctx)
                    .await
                    .unwrap_or_else(|e| error_response(&e));
                let record = ExecutableResponse::Sync {
                    status: response.status,
                };
                self.nodes
                    .update(&node.uuid, |n| n.executable_responses.push(record.clone()))
                    .await?;
                self.process_step_response(&node.uuid, response).await
            }
            Executable::Async(step) => {
                let response = match step.execute_async(&ctx).await {
                    Ok(response) => response,
                    Err(e) => return self.process_step_response(&node.uuid, error_response(&e)).await,
                };
                let record = ExecutableResponse::Async {
                    callback_ids: response.callback_ids.clone(),
                };
                let Some(node) = self.suspend(&node.uuid, Status::AsyncWaiting, record).await? else {
                    return Ok(false);
                };
                self.await_callbacks(&node, response.callback_ids).await?;
                for child_plan in response.child_plans {
                    let event = StartChildPlanEvent {
                        parent_plan_execution_id: node.plan_execution_id().to_string(),
                        parent_node_execution_id: node.uuid.clone(),
                        plan_id: child_plan.plan_id,
                        plan_execution_id: child_plan.plan_execution_id,
                    };
                    self.publish(&node.ambiance, EventCategory::StartChildPlan, &event, false)
                        .await?;
                }
                Ok(true)
            }
            Executable::Child(step) => {
                let child = match step.obtain_child(&ctx).await.and_then(|request| {
                    Ok(self.prepare_node(
                        &node.ambiance,
                        plan.node(&request.child_node_id)?,
                        NodeLinks::child_of(&node),
                    ))
                }) {
                    Ok(child) => child,
                    Err(e) => return self.process_step_response(&node.uuid, error_response(&e)).await,
                };
                let record = ExecutableResponse::Child {
                    child_runtime_id: child.uuid.clone(),
                };
                self.spawn_children(&node, vec![child], record).await
            }
            Executable::Children(step) => {
                let children = match step.obtain_children(&ctx).await.and_then(|request| {
                    request
                        .child_node_ids
                        .iter()
                        .map(|id| {
                            Ok(self.prepare_node(
                                &node.ambiance,
                                plan.node(id)?,
                                NodeLinks::child_of(&node),
                            ))
                        })
                        .collect::<Result<Vec<_>>>()
                }) {
                    Ok(children) => children,
                    Err(e) => return self.process_step_response(&node.uuid, error_response(&e)).await,
                };
                let record = ExecutableResponse::Children {
                    child_runtime_ids: children.iter().map(|c| c.uuid.clone()).collect(),
                };
                self.spawn_children(&node, children, record).await
            }
            Executable::Task(step) => {
                let dispatched = match step.obtain_task(&ctx).await {
                    Ok(request) => self.tasks.dispatch(&node.ambiance, request).await,
                    Err(e) => Err(e),
                };
                let task_id = match dispatched {
                    Ok(task_id) => task_id,
                    Err(e) => return self.process_step_response(&node.uuid, error_response(&e)).await,
                };
                let record = ExecutableResponse::Task {
                    task_id: task_id.clone(),
                };
                let Some(node) = self.suspend(&node.uuid, Status::TaskWaiting, record).await? else {
                    return Ok(false);
                };
                self.await_callbacks(&node, vec![task_id]).await?;
                Ok(true)
            }
        }
    }

    /// Suspend the parent, register the wait and only then queue the
    /// children, so no child can report before anyone waits on it.
    async fn spawn_children(
        &self,
        parent: &NodeExecution,
        children: Vec<NodeExecution>,
        record: ExecutableResponse,
    ) -> Result<bool> {
        let Some(parent) = self.suspend(&parent.uuid, Status::AsyncWaiting, record).await? else {
            return Ok(false);
        };
        self.await_callbacks(&parent, children.iter().map(|c| c.uuid.clone()).collect())
            .await?;
        for child in children {
            self.queue_node(child, 0).await?;
        }
        Ok(true)
    }

    /// Move a running node into a waiting status. `None` when the node was
    /// asked to discontinue meanwhile; it is then aborted and concluded.
    async fn suspend(
        &self,
        id: &str,
        to: Status,
        record: ExecutableResponse,
    ) -> Result<Option<NodeExecution>> {
        let suspended = self
            .set_status_from(id, &[Status::Running], to, |n| {
                n.executable_responses.push(record.clone());
            })
            .await?;
        if suspended.is_none() {
            self.finish_discontinued(id).await?;
        }
        Ok(suspended)
    }

    async fn await_callbacks(&self, node: &NodeExecution, correlation_ids: Vec<String>) -> Result<()> {
        let completed = self
            .waiter
            .wait_for_all(node.plan_execution_id(), &node.uuid, correlation_ids);
        if let Some(completed) = completed {
            self.publish_resume(completed).await?;
        }
        Ok(())
    }

    /// Resume a suspended node with the responses it waited for.
    pub async fn resume_node(&self, node_execution_id: &str, responses: ResponseMap) -> Result<bool> {
        let node = self.nodes.get(node_execution_id).await?;
        match node.status {
            Status::AsyncWaiting | Status::TaskWaiting => {}
            Status::Discontinuing => return self.finish_discontinued(&node.uuid).await,
            other => {
                log::debug!("Node {} is {}, ignoring resume", node_execution_id, other);
                return Ok(false);
            }
        }

        let Some(node) = self
            .set_status_from(
                &node.uuid,
                &[Status::AsyncWaiting, Status::TaskWaiting],
                Status::Running,
                |_| {},
            )
            .await?
        else {
            return Ok(false);
        };

        let (_, plan_node) = self.plan_node_of(&node)?;
        let executable = match self.facilitator.resolve(&plan_node) {
            Ok(executable) => executable,
            Err(e) => return self.process_step_response(&node.uuid, error_response(&e)).await,
        };
        let ctx = Self::step_context(&node, &plan_node);
        let result = match executable {
            Executable::Sync(_) => Err(EngineError::invalid(format!(
                "sync node {} cannot be resumed",
                node.uuid
            ))),
            Executable::Async(step) => step.handle_async_response(&ctx, &responses).await,
            Executable::Child(step) => step.handle_child_response(&ctx, &responses).await,
            Executable::Children(step) => step.handle_children_response(&ctx, &responses).await,
            Executable::Task(step) => match responses.values().next() {
                Some(response) => step.handle_task_result(&ctx, response).await,
                None => Err(EngineError::invalid(format!(
                    "task node {} resumed without a result",
                    node.uuid
                ))),
            },
        };
        let response = result.unwrap_or_else(|e| error_response(&e));
        self.process_step_response(&node.uuid, response).await
    }

    /// A discontinuing node that reached a suspension point ends aborted.
    pub(super) async fn finish_discontinued(&self, id: &str) -> Result<bool> {
        self.waiter.cancel(id);
        match self
            .set_status_from(id, &[Status::Discontinuing], Status::Aborted, |_| {})
            .await?
        {
            Some(aborted) => {
                log::info!("Node {} ({}) aborted", aborted.uuid, aborted.identifier);
                self.conclude(&aborted).await
            }
            None => Ok(false),
        }
    }
}
