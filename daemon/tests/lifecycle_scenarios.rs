//! Integration test: task lifecycle driven over HTTP, observed over the push channel
//!
//! Each test starts an in-process bridge on an ephemeral port, connects a
//! push client as the browser extension, and drives the task with the same
//! HTTP calls the agent hooks and the extension make.
//!
//! Run with: cargo test --test lifecycle_scenarios

mod helpers;

use agent_bridge_lib::bridge::protocol::{BridgeEvent, CANCELLED_MESSAGE};
use helpers::bridge_guard::BridgeGuard;
use helpers::polling::{drain_events, wait_for_event};
use serde_json::json;
use std::time::Duration;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_WINDOW: Duration = Duration::from_millis(200);

fn is_need_input(event: &BridgeEvent) -> bool {
    matches!(event, BridgeEvent::TaskNeedInput { .. })
}

fn is_done(event: &BridgeEvent) -> bool {
    matches!(event, BridgeEvent::TaskDone { .. })
}

#[tokio::test]
async fn test_happy_path_apply() {
    let guard = BridgeGuard::start(&[]).await.expect("bridge should start");
    let mut ws = guard.connect_extension().await;

    let (status, body) = guard
        .post("/agent/start", json!({"prompt": "Fix bug", "repoId": "repoA"}))
        .await;
    assert_eq!(status, 200);
    let task_id = body["taskId"].as_str().unwrap().to_string();

    let events = wait_for_event(&mut ws, "task.need_input", is_need_input, EVENT_TIMEOUT)
        .await
        .unwrap();

    match &events[0] {
        BridgeEvent::TaskStarted {
            task_id: id,
            repo_id,
            prompt,
            ..
        } => {
            assert_eq!(id, &task_id);
            assert_eq!(repo_id, "repoA");
            assert_eq!(prompt, "Fix bug");
        }
        other => panic!("Expected task.started first, got {:?}", other),
    }
    assert!(events
        .iter()
        .all(|e| e.task_id() == task_id && !e.is_cancellation()));

    match events.last().unwrap() {
        BridgeEvent::TaskNeedInput { choices, .. } => {
            let ids: Vec<&str> = choices.iter().map(|c| c.id.as_str()).collect();
            assert_eq!(ids, vec!["apply", "skip", "modify"]);
        }
        other => panic!("Expected task.need_input, got {:?}", other),
    }

    let (_, current) = guard.get("/task/current").await;
    assert_eq!(current["task"]["status"], "waiting_input");

    let (status, _) = guard
        .post("/task/choice", json!({"taskId": task_id, "choiceId": "apply"}))
        .await;
    assert_eq!(status, 200);

    let events = wait_for_event(&mut ws, "task.done", is_done, EVENT_TIMEOUT)
        .await
        .unwrap();
    match events.last().unwrap() {
        BridgeEvent::TaskDone { task_id: id, meta, .. } => {
            assert_eq!(id, &task_id);
            assert_eq!(meta["changedFiles"], 3);
            assert_eq!(meta["choice"], "apply");
        }
        other => panic!("Expected task.done, got {:?}", other),
    }

    // Slot is free again
    let (_, current) = guard.get("/task/current").await;
    assert!(current["task"].is_null());
    let (status, _) = guard.post("/agent/start", json!({"prompt": "Next"})).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_immediate_cancel_never_completes() {
    let guard = BridgeGuard::start(&[]).await.expect("bridge should start");
    let mut ws = guard.connect_extension().await;

    let (_, body) = guard.post("/agent/start", json!({"prompt": "Fix bug"})).await;
    let task_id = body["taskId"].as_str().unwrap().to_string();

    let (status, body) = guard
        .post("/task/cancel", json!({"taskId": task_id}))
        .await;
    assert_eq!(status, 200, "cancel failed: {}", body);

    let events = wait_for_event(
        &mut ws,
        "cancellation",
        BridgeEvent::is_cancellation,
        EVENT_TIMEOUT,
    )
    .await
    .unwrap();
    match events.last().unwrap() {
        BridgeEvent::TaskError { message, .. } => assert_eq!(message, CANCELLED_MESSAGE),
        other => panic!("Expected task.error, got {:?}", other),
    }

    let later = drain_events(&mut ws, QUIET_WINDOW).await;
    assert!(
        events.iter().chain(later.iter()).all(|e| !is_done(e)),
        "a cancelled task must never report done"
    );

    let (_, current) = guard.get("/task/current").await;
    assert!(current["task"].is_null());

    // A second cancel finds nothing
    let (status, _) = guard
        .post("/task/cancel", json!({"taskId": task_id}))
        .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_choice() {
    let guard = BridgeGuard::start(&[]).await.expect("bridge should start");
    let mut ws = guard.connect_extension().await;

    let (_, body) = guard.post("/agent/start", json!({"prompt": "Fix bug"})).await;
    let task_id = body["taskId"].as_str().unwrap().to_string();
    wait_for_event(&mut ws, "task.need_input", is_need_input, EVENT_TIMEOUT)
        .await
        .unwrap();

    let (status, _) = guard
        .post("/task/cancel", json!({"taskId": task_id}))
        .await;
    assert_eq!(status, 200);

    // The pending choice is gone with the task
    let (status, _) = guard
        .post("/task/choice", json!({"taskId": task_id, "choiceId": "apply"}))
        .await;
    assert_eq!(status, 409);

    let events = drain_events(&mut ws, QUIET_WINDOW).await;
    assert!(events.iter().any(BridgeEvent::is_cancellation));
    assert!(events.iter().all(|e| !is_done(e)));
}

#[tokio::test]
async fn test_agent_hooks_with_caller_id() {
    let guard = BridgeGuard::start(&[("AGENT_BRIDGE_STEP_DELAY_MS", "60000")])
        .await
        .expect("bridge should start");
    let mut ws = guard.connect_extension().await;

    let (status, body) = guard
        .post(
            "/agent/start",
            json!({"prompt": "Refactor", "taskId": "session-7", "repoId": "repoB"}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["taskId"], "session-7");

    let (status, _) = guard
        .post(
            "/agent/log",
            json!({"taskId": "session-7", "message": "cargo test", "level": "command"}),
        )
        .await;
    assert_eq!(status, 200);

    wait_for_event(
        &mut ws,
        "agent log line",
        |e| matches!(e, BridgeEvent::TaskLog { message, .. } if message == "cargo test"),
        EVENT_TIMEOUT,
    )
    .await
    .unwrap();

    let (status, _) = guard
        .post("/agent/done", json!({"taskId": "session-7"}))
        .await;
    assert_eq!(status, 200);

    let events = wait_for_event(&mut ws, "task.done", is_done, EVENT_TIMEOUT)
        .await
        .unwrap();
    match events.last().unwrap() {
        BridgeEvent::TaskDone { summary, meta, .. } => {
            assert_eq!(summary, "Task completed");
            assert_eq!(meta["source"], "agent");
        }
        other => panic!("Expected task.done, got {:?}", other),
    }

    let (_, current) = guard.get("/task/current").await;
    assert!(current["task"].is_null());
}

#[tokio::test]
async fn test_second_start_conflicts_while_running() {
    let guard = BridgeGuard::start(&[("AGENT_BRIDGE_STEP_DELAY_MS", "60000")])
        .await
        .expect("bridge should start");

    let (_, first) = guard.post("/agent/start", json!({"prompt": "One"})).await;
    let (status, conflict) = guard.post("/agent/start", json!({"prompt": "Two"})).await;

    assert_eq!(status, 409);
    assert_eq!(conflict["ok"], false);
    assert_eq!(conflict["taskId"], first["taskId"]);

    let (_, current) = guard.get("/task/current").await;
    assert_eq!(current["task"]["prompt"], "One");
}

#[tokio::test]
async fn test_every_push_client_sees_events() {
    let guard = BridgeGuard::start(&[("AGENT_BRIDGE_STEP_DELAY_MS", "60000")])
        .await
        .expect("bridge should start");
    let mut first = guard.connect_extension().await;
    let mut second = guard.connect_extension().await;

    guard.post("/agent/start", json!({"prompt": "Fan out"})).await;

    for ws in [&mut first, &mut second] {
        let events = wait_for_event(
            ws,
            "task.started",
            |e| matches!(e, BridgeEvent::TaskStarted { .. }),
            EVENT_TIMEOUT,
        )
        .await
        .unwrap();
        assert_eq!(events.len(), 1);
    }
}
