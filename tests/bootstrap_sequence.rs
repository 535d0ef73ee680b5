mod helpers;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use labforge::core::{Plan, PlanConfig, RunContext, RunStatus, Sensitive, StageState};
use labforge::exec::{BootstrapEngine, EngineError, RunEvent};

use helpers::MockDriver;

const SIMPLE_PLAN: &str = r#"
name: test-lab
stages:
  - id: cluster
    name: Cluster
    kind: k3s
  - id: store
    name: Store
    kind: vault-dev
    depends_on: [cluster]
  - id: app
    name: App
    kind: helm
    chart: charts/app
    release: app
    namespace: apps
    depends_on: [store]
    readiness:
      check: immediate
"#;

fn plan_from(yaml: &str) -> Plan {
    let config = PlanConfig::from_yaml(yaml).unwrap();
    config.to_plan()
}

fn test_context() -> RunContext {
    RunContext::new(
        "http://127.0.0.1:8200".to_string(),
        Sensitive::new("test-token".to_string()),
        PathBuf::from("/tmp/labforge-test-key"),
    )
}

#[tokio::test]
async fn test_stages_install_in_dependency_order() {
    let mut plan = plan_from(SIMPLE_PLAN);
    let mut ctx = test_context();
    let engine = BootstrapEngine::new(MockDriver::new());
    let cancel = AtomicBool::new(false);

    engine
        .bootstrap(&mut plan, &mut ctx, &cancel)
        .await
        .unwrap();

    let order = engine.driver().install_order();
    assert_eq!(order, vec!["cluster", "store", "app"]);
    assert!(matches!(plan.state.status, RunStatus::Completed));
    assert!(plan.is_complete());
}

#[tokio::test]
async fn test_failed_install_stops_the_run() {
    let mut plan = plan_from(SIMPLE_PLAN);
    let mut ctx = test_context();
    let engine = BootstrapEngine::new(MockDriver::new().failing_on("store"));
    let cancel = AtomicBool::new(false);

    let result = engine.bootstrap(&mut plan, &mut ctx, &cancel).await;

    assert!(matches!(result, Err(EngineError::Install { .. })));
    assert_eq!(engine.driver().install_order(), vec!["cluster"]);
    assert!(matches!(plan.state.status, RunStatus::Failed));
    assert!(matches!(
        plan.stage("store").unwrap().state,
        StageState::Failed { .. }
    ));
    // The stage after the failure is never touched
    assert!(matches!(
        plan.stage("app").unwrap().state,
        StageState::Pending
    ));
}

#[tokio::test]
async fn test_readiness_timeout_fails_the_stage() {
    let yaml = r#"
name: timeout-lab
stages:
  - id: cluster
    name: Cluster
    kind: k3s
    poll_interval_secs: 1
    deadline_secs: 1
"#;
    let mut plan = plan_from(yaml);
    let mut ctx = test_context();
    let engine = BootstrapEngine::new(MockDriver::new().never_ready_on("cluster"));
    let cancel = AtomicBool::new(false);

    let result = engine.bootstrap(&mut plan, &mut ctx, &cancel).await;

    assert!(matches!(result, Err(EngineError::Readiness { .. })));
    assert!(matches!(plan.state.status, RunStatus::Failed));
}

#[tokio::test]
async fn test_slow_stage_is_polled_until_ready() {
    let yaml = r#"
name: slow-lab
stages:
  - id: cluster
    name: Cluster
    kind: k3s
    poll_interval_secs: 1
    deadline_secs: 30
"#;
    let mut plan = plan_from(yaml);
    let mut ctx = test_context();
    let engine = BootstrapEngine::new(MockDriver::new().ready_after("cluster", 2));
    let cancel = AtomicBool::new(false);

    engine
        .bootstrap(&mut plan, &mut ctx, &cancel)
        .await
        .unwrap();

    assert!(matches!(
        plan.stage("cluster").unwrap().state,
        StageState::Ready { .. }
    ));
}

#[tokio::test]
async fn test_events_follow_the_stage_lifecycle() {
    let mut plan = plan_from(SIMPLE_PLAN);
    let mut ctx = test_context();
    let engine = BootstrapEngine::new(MockDriver::new());
    let cancel = AtomicBool::new(false);

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine.add_event_handler(move |event| {
        sink.lock().unwrap().push(event);
    });
    // Handler registration is spawned; let it land before the run
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    engine
        .bootstrap(&mut plan, &mut ctx, &cancel)
        .await
        .unwrap();

    let events = events.lock().unwrap();
    assert!(matches!(events.first(), Some(RunEvent::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(RunEvent::RunCompleted {
            status: RunStatus::Completed,
            ..
        })
    ));

    // Each stage goes Started, Waiting, Ready in that order
    let cluster_events: Vec<_> = events
        .iter()
        .filter(|e| match e {
            RunEvent::StageStarted { stage_id, .. }
            | RunEvent::StageWaiting { stage_id, .. }
            | RunEvent::StageReady { stage_id, .. } => stage_id == "cluster",
            _ => false,
        })
        .collect();
    assert_eq!(cluster_events.len(), 3);
    assert!(matches!(cluster_events[0], RunEvent::StageStarted { .. }));
    assert!(matches!(cluster_events[1], RunEvent::StageWaiting { .. }));
    assert!(matches!(cluster_events[2], RunEvent::StageReady { .. }));
}

#[tokio::test]
async fn test_cancellation_before_a_stage_marks_the_run_cancelled() {
    let mut plan = plan_from(SIMPLE_PLAN);
    let mut ctx = test_context();
    let engine = BootstrapEngine::new(MockDriver::new());
    let cancel = AtomicBool::new(true);

    let result = engine.bootstrap(&mut plan, &mut ctx, &cancel).await;

    assert!(matches!(result, Err(EngineError::Cancelled { .. })));
    assert!(matches!(plan.state.status, RunStatus::Cancelled));
    assert!(engine.driver().install_order().is_empty());
}

#[tokio::test]
async fn test_successful_run_scrubs_the_store_token() {
    let mut plan = plan_from(SIMPLE_PLAN);
    let mut ctx = test_context();
    let engine = BootstrapEngine::new(MockDriver::new());
    let cancel = AtomicBool::new(false);

    engine
        .bootstrap(&mut plan, &mut ctx, &cancel)
        .await
        .unwrap();

    assert!(ctx.store_token().is_none());
}
