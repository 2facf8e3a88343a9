//! Shared fixtures for the runtime scenarios

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline_engine::executable::{
    ExecutableResponse, SyncExecutable, TaskExecutable, TaskRequest,
};
use pipeline_engine::interrupt::{Interrupt, InterruptState};
use pipeline_engine::{
    EngineBuilder, EngineConfig, Executable, FailureInfo, FailureType, NodeExecution,
    NotifyResponse, OrchestrationRuntime, Result, StepContext, StepResponse,
};
use serde_json::{json, Value};

pub const WAIT: Duration = Duration::from_secs(5);

/// Fails with the failure type named by `fail`, succeeds otherwise.
pub struct ShellStep;

#[async_trait]
impl SyncExecutable for ShellStep {
    async fn execute_sync(&self, ctx: &StepContext) -> Result<StepResponse> {
        match ctx.parameters.get("fail").and_then(Value::as_str) {
            Some(kind) => {
                let failure_type: FailureType = kind.parse()?;
                Ok(StepResponse::failed(
                    FailureInfo::new(format!("{} failed", ctx.identifier()))
                        .with_failure_type(failure_type),
                ))
            }
            None => Ok(StepResponse::succeeded().with_outcome("ranAs", json!(ctx.identifier()))),
        }
    }
}

/// Sleeps `sleepMs`, then succeeds.
pub struct SleepStep;

#[async_trait]
impl SyncExecutable for SleepStep {
    async fn execute_sync(&self, ctx: &StepContext) -> Result<StepResponse> {
        let sleep_ms = ctx
            .parameters
            .get("sleepMs")
            .and_then(Value::as_u64)
            .unwrap_or(100);
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        Ok(StepResponse::succeeded())
    }
}

/// Fails with a connectivity failure until its failures are used up.
pub struct FlakyStep {
    failures_left: AtomicU32,
}

impl FlakyStep {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
        })
    }
}

#[async_trait]
impl SyncExecutable for FlakyStep {
    async fn execute_sync(&self, _ctx: &StepContext) -> Result<StepResponse> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Ok(StepResponse::failed(
                FailureInfo::new("connection reset")
                    .with_failure_type(FailureType::ConnectivityFailure),
            ));
        }
        Ok(StepResponse::succeeded())
    }
}

/// Hands a deployment to the task delegate and reports its status.
pub struct DeployTask;

#[async_trait]
impl TaskExecutable for DeployTask {
    async fn obtain_task(&self, ctx: &StepContext) -> Result<TaskRequest> {
        Ok(TaskRequest {
            task_type: "deploy".into(),
            payload: ctx.parameters.clone(),
        })
    }

    async fn handle_task_result(
        &self,
        _ctx: &StepContext,
        response: &NotifyResponse,
    ) -> Result<StepResponse> {
        let mut result = StepResponse::with_status(response.status);
        result.failure_info = response.failure_info.clone();
        Ok(result)
    }
}

pub fn builder() -> EngineBuilder {
    let _ = env_logger::builder().is_test(true).try_init();
    EngineBuilder::new(EngineConfig::default())
        .with_step("SHELL", Executable::Sync(Arc::new(ShellStep)))
        .with_step("SLEEP", Executable::Sync(Arc::new(SleepStep)))
        .with_step("DEPLOY", Executable::Task(Arc::new(DeployTask)))
}

pub fn runtime() -> OrchestrationRuntime {
    OrchestrationRuntime::start_with(builder()).unwrap()
}

pub async fn node_of(
    runtime: &OrchestrationRuntime,
    plan_execution_id: &str,
    plan_node_id: &str,
    status: pipeline_engine::Status,
) -> NodeExecution {
    runtime
        .wait_for_node(plan_execution_id, WAIT, |n| {
            n.plan_node_id == plan_node_id && n.status == status && !n.old_retry
        })
        .await
        .unwrap()
}

pub fn task_id_of(node: &NodeExecution) -> String {
    node.executable_responses
        .iter()
        .find_map(|r| match r {
            ExecutableResponse::Task { task_id } => Some(task_id.clone()),
            _ => None,
        })
        .expect("node was dispatched as a task")
}

/// Wait until an interrupt left `REGISTERED` and `PROCESSING`.
pub async fn settled(runtime: &OrchestrationRuntime, interrupt: &Interrupt) -> Interrupt {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let current = runtime
            .engine()
            .interrupts()
            .get(&interrupt.uuid)
            .await
            .unwrap();
        if !matches!(
            current.state,
            InterruptState::Registered | InterruptState::Processing
        ) {
            return current;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "interrupt {} never settled",
            interrupt.uuid
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
