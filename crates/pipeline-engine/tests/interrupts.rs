//! Interrupts against running plans

mod common;

use std::collections::BTreeMap;

use common::{node_of, runtime, settled, task_id_of, WAIT};
use pipeline_engine::advise::adviser_types;
use pipeline_engine::executable::ExecutableResponse;
use pipeline_engine::interrupt::InterruptState;
use pipeline_engine::{
    InterruptRequest, InterruptType, IssuedBy, NotifyResponse, OrchestrationRuntime, PlanBuilder,
    Status, StepType,
};
use pipeline_contracts::{step_types, FacilitatorType};
use serde_json::json;

async fn interrupt(
    runtime: &OrchestrationRuntime,
    request: InterruptRequest,
) -> pipeline_engine::interrupt::Interrupt {
    let registered = runtime.engine().register_interrupt(request).await.unwrap();
    settled(runtime, &registered).await
}

fn abort(pe: &str, node: &str) -> InterruptRequest {
    InterruptRequest::new(InterruptType::Abort, pe, IssuedBy::manual("ops")).for_node(node)
}

#[tokio::test]
async fn test_abort_one_branch_fails_the_fork() {
    let runtime = runtime();
    let engine = runtime.engine();
    let plan = PlanBuilder::new("rollout", "Rollout")
        .add_node(
            "fork",
            "regions",
            StepType::step(step_types::FORK),
            FacilitatorType::Children,
        )
        .with_parameters(json!({"childNodeIds": ["eu", "us"]}))
        .add_node("eu", "eu", StepType::step("DEPLOY"), FacilitatorType::Task)
        .add_node("us", "us", StepType::step("DEPLOY"), FacilitatorType::Task)
        .build();
    engine.register_plan(plan).unwrap();
    let pe = engine
        .start_plan("rollout", BTreeMap::new())
        .await
        .unwrap()
        .uuid;

    let eu = node_of(&runtime, &pe, "eu", Status::TaskWaiting).await;
    let us = node_of(&runtime, &pe, "us", Status::TaskWaiting).await;

    let first = interrupt(&runtime, abort(&pe, &eu.uuid)).await;
    assert_eq!(first.state, InterruptState::Processed);
    let eu = engine.node_executions().get(&eu.uuid).await.unwrap();
    assert_eq!(eu.status, Status::Aborted);
    assert_eq!(eu.interrupt_histories.len(), 1);
    assert_eq!(eu.interrupt_histories[0].interrupt_id, first.uuid);

    let again = interrupt(&runtime, abort(&pe, &eu.uuid)).await;
    assert_eq!(again.state, InterruptState::Discarded);

    engine
        .notify(&task_id_of(&us), NotifyResponse::new(Status::Succeeded))
        .await
        .unwrap();
    let done = runtime.wait_for_plan(&pe, WAIT).await.unwrap();
    assert_eq!(done.status, Status::Failed);
    runtime.shutdown();
}

#[tokio::test]
async fn test_abort_all_cascades_to_chained_plan() {
    let runtime = runtime();
    let engine = runtime.engine();
    engine
        .register_plan(
            PlanBuilder::new("child", "Child")
                .add_node("deploy", "deploy", StepType::step("DEPLOY"), FacilitatorType::Task)
                .build(),
        )
        .unwrap();
    engine
        .register_plan(
            PlanBuilder::new("parent", "Parent")
                .add_node(
                    "stage",
                    "chain",
                    StepType::step(step_types::PIPELINE_STAGE),
                    FacilitatorType::Async,
                )
                .with_parameters(json!({"planId": "child"}))
                .build(),
        )
        .unwrap();
    let pe = engine
        .start_plan("parent", BTreeMap::new())
        .await
        .unwrap()
        .uuid;

    let stage = node_of(&runtime, &pe, "stage", Status::AsyncWaiting).await;
    let child_pe = stage
        .executable_responses
        .iter()
        .find_map(|r| match r {
            ExecutableResponse::Async { callback_ids } => callback_ids.first().cloned(),
            _ => None,
        })
        .unwrap();
    node_of(&runtime, &child_pe, "deploy", Status::TaskWaiting).await;
    let child = engine.plan_executions().get(&child_pe).await.unwrap();
    assert_eq!(
        child.parent.as_ref().map(|p| p.node_execution_id.as_str()),
        Some(stage.uuid.as_str())
    );

    let abort_all = interrupt(
        &runtime,
        InterruptRequest::new(InterruptType::AbortAll, pe.clone(), IssuedBy::manual("ops")),
    )
    .await;
    assert_eq!(abort_all.state, InterruptState::Processed);

    assert_eq!(runtime.wait_for_plan(&pe, WAIT).await.unwrap().status, Status::Aborted);
    assert_eq!(
        runtime.wait_for_plan(&child_pe, WAIT).await.unwrap().status,
        Status::Aborted
    );
    let cascaded = engine.interrupts().fetch_for_plan(&child_pe).await.unwrap();
    assert_eq!(cascaded.len(), 1);
    assert_eq!(cascaded[0].interrupt_type, InterruptType::AbortAll);
    assert_eq!(cascaded[0].issued_by, IssuedBy::System);
    runtime.shutdown();
}

#[tokio::test]
async fn test_paused_plan_holds_next_node_until_resumed() {
    let runtime = runtime();
    let engine = runtime.engine();
    let plan = PlanBuilder::new("ship", "Ship")
        .add_node("deploy", "deploy", StepType::step("DEPLOY"), FacilitatorType::Task)
        .with_adviser(adviser_types::ON_SUCCESS, &json!({"nextNodeId": "verify"}))
        .unwrap()
        .add_node("verify", "verify", StepType::step("SHELL"), FacilitatorType::Sync)
        .start_at("deploy")
        .build();
    engine.register_plan(plan).unwrap();
    let pe = engine.start_plan("ship", BTreeMap::new()).await.unwrap().uuid;
    let deploy = node_of(&runtime, &pe, "deploy", Status::TaskWaiting).await;

    let pause = interrupt(
        &runtime,
        InterruptRequest::new(InterruptType::Pause, pe.clone(), IssuedBy::manual("ops")),
    )
    .await;
    assert_eq!(pause.state, InterruptState::Processed);
    assert_eq!(
        engine.plan_executions().get(&pe).await.unwrap().status,
        Status::Paused
    );

    engine
        .notify(&task_id_of(&deploy), NotifyResponse::new(Status::Succeeded))
        .await
        .unwrap();
    node_of(&runtime, &pe, "verify", Status::Paused).await;

    let resume = interrupt(
        &runtime,
        InterruptRequest::new(InterruptType::Resume, pe.clone(), IssuedBy::manual("ops")),
    )
    .await;
    assert_eq!(resume.state, InterruptState::Processed);

    let done = runtime.wait_for_plan(&pe, WAIT).await.unwrap();
    assert_eq!(done.status, Status::Succeeded);
    node_of(&runtime, &pe, "verify", Status::Succeeded).await;
    runtime.shutdown();
}

#[tokio::test]
async fn test_running_node_is_aborted_once_its_step_returns() {
    let runtime = runtime();
    let engine = runtime.engine();
    let plan = PlanBuilder::new("slow", "Slow")
        .add_node("wait", "wait", StepType::step("SLEEP"), FacilitatorType::Sync)
        .with_parameters(json!({"sleepMs": 300}))
        .build();
    engine.register_plan(plan).unwrap();
    let pe = engine.start_plan("slow", BTreeMap::new()).await.unwrap().uuid;
    let running = node_of(&runtime, &pe, "wait", Status::Running).await;

    let aborted = interrupt(&runtime, abort(&pe, &running.uuid)).await;
    assert_eq!(aborted.state, InterruptState::Processed);

    let done = runtime.wait_for_plan(&pe, WAIT).await.unwrap();
    assert_eq!(done.status, Status::Aborted);
    let node = engine.node_executions().get(&running.uuid).await.unwrap();
    assert_eq!(node.status, Status::Aborted);
    runtime.shutdown();
}

#[tokio::test]
async fn test_retry_interrupt_reruns_intervention_node() {
    let runtime = runtime();
    let engine = runtime.engine();
    let plan = PlanBuilder::new("upload", "Upload")
        .add_node("push", "push", StepType::step("SHELL"), FacilitatorType::Sync)
        .with_parameters(json!({"fail": "CONNECTIVITY_FAILURE"}))
        .with_adviser(
            adviser_types::MANUAL_INTERVENTION_WITH_ROLLBACK,
            &json!({"applicableFailureTypes": ["CONNECTIVITY_FAILURE"]}),
        )
        .unwrap()
        .build();
    engine.register_plan(plan).unwrap();
    let pe = engine.start_plan("upload", BTreeMap::new()).await.unwrap().uuid;
    let waiting = node_of(&runtime, &pe, "push", Status::InterventionWaiting).await;

    let retry = interrupt(
        &runtime,
        InterruptRequest::new(InterruptType::Retry, pe.clone(), IssuedBy::manual("ops"))
            .for_node(waiting.uuid.clone()),
    )
    .await;
    assert_eq!(retry.state, InterruptState::Processed);

    // The step fails the same way, so the retried node waits again.
    let again = runtime
        .wait_for_node(&pe, WAIT, |n| {
            n.status == Status::InterventionWaiting && n.uuid != waiting.uuid
        })
        .await
        .unwrap();
    assert_eq!(again.retry_ids, vec![waiting.uuid.clone()]);
    let old = engine.node_executions().get(&waiting.uuid).await.unwrap();
    assert!(old.old_retry);
    assert_eq!(engine.timeouts().pending_for_node(&waiting.uuid), 0);
    assert_eq!(engine.timeouts().pending_for_node(&again.uuid), 1);
    runtime.shutdown();
}

#[tokio::test]
async fn test_mark_failed_after_exhausted_retries_fails_the_node() {
    let runtime = runtime();
    let engine = runtime.engine();
    let plan = PlanBuilder::new("migrate", "Migrate")
        .add_node("apply", "apply", StepType::step("SHELL"), FacilitatorType::Sync)
        .with_parameters(json!({"fail": "APPLICATION_FAILURE"}))
        .with_adviser(
            adviser_types::RETRY,
            &json!({"retryCount": 0, "repairActionCodeAfterRetry": "MANUAL_INTERVENTION"}),
        )
        .unwrap()
        .build();
    engine.register_plan(plan).unwrap();
    let pe = engine.start_plan("migrate", BTreeMap::new()).await.unwrap().uuid;
    let waiting = node_of(&runtime, &pe, "apply", Status::InterventionWaiting).await;
    assert_eq!(engine.timeouts().pending_for_node(&waiting.uuid), 1);

    let mark_failed = interrupt(
        &runtime,
        InterruptRequest::new(InterruptType::MarkFailed, pe.clone(), IssuedBy::manual("ops"))
            .for_node(waiting.uuid.clone()),
    )
    .await;
    assert_eq!(mark_failed.state, InterruptState::Processed);

    let done = runtime.wait_for_plan(&pe, WAIT).await.unwrap();
    assert_eq!(done.status, Status::Failed);
    let node = engine.node_executions().get(&waiting.uuid).await.unwrap();
    assert_eq!(node.status, Status::Failed);
    assert_eq!(node.interrupt_histories.len(), 1);
    assert_eq!(engine.timeouts().pending_for_node(&waiting.uuid), 0);
    runtime.shutdown();
}

#[tokio::test]
async fn test_abort_all_during_rollback_aborts_the_plan() {
    let runtime = runtime();
    let engine = runtime.engine();
    let plan = PlanBuilder::new("deploy", "Deploy")
        .add_node("apply", "apply", StepType::step("SHELL"), FacilitatorType::Sync)
        .with_parameters(json!({"fail": "APPLICATION_FAILURE"}))
        .with_adviser(adviser_types::ON_FAIL_PIPELINE_ROLLBACK, &json!({}))
        .unwrap()
        .add_node("undo", "undo", StepType::step("SLEEP"), FacilitatorType::Sync)
        .with_parameters(json!({"sleepMs": 800}))
        .start_at("apply")
        .rollback_at("undo")
        .build();
    engine.register_plan(plan).unwrap();
    let pe = engine.start_plan("deploy", BTreeMap::new()).await.unwrap().uuid;
    let undo = node_of(&runtime, &pe, "undo", Status::Running).await;

    let abort_all = interrupt(
        &runtime,
        InterruptRequest::new(InterruptType::AbortAll, pe.clone(), IssuedBy::manual("ops")),
    )
    .await;
    assert_eq!(abort_all.state, InterruptState::Processed);

    let done = runtime.wait_for_plan(&pe, WAIT).await.unwrap();
    assert_eq!(done.status, Status::Aborted);
    assert!(done.rollback_mode);
    assert_eq!(done.pre_rollback_status, Some(Status::Failed));
    let undo = runtime
        .wait_for_node(&pe, WAIT, |n| n.uuid == undo.uuid && n.status == Status::Aborted)
        .await
        .unwrap();
    assert_eq!(undo.interrupt_histories.len(), 1);
    runtime.shutdown();
}
