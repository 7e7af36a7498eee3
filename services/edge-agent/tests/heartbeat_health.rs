//! Heartbeat and health-check behavior against scripted mock backends.
//!
//! Tests verify:
//! - Offline heartbeats report every backend and policy offline
//! - Healthy backends and applied policies report running
//! - Erroring backends are restarted once past the cool-down, never within it
//! - Restarts of one backend never overlap

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use edge_agent::backend::{BackendRegistry, MockBackend, RunningStatus};
use edge_agent::comms::LoopbackTransport;
use edge_agent::heartbeat::AgentState;
use edge_agent::task::TaskMeta;
use edge_agent::{Agent, Config};

const CONFIG: &str = r#"
version: "1.0"
agent:
  backends:
    mock: {}
  policies:
    mock:
      p1:
        kind: collection
  heartbeat:
    interval_secs: 3600
"#;

struct Harness {
    agent: Arc<Agent>,
    mock: Arc<MockBackend>,
    transport: Arc<LoopbackTransport>,
}

async fn started(mock: MockBackend) -> Harness {
    let mock = Arc::new(mock);
    let transport = Arc::new(LoopbackTransport::connected());
    let mut registry = BackendRegistry::new();
    registry.register("mock", mock.clone());

    let config = Config::from_yaml_str(CONFIG).expect("config parses");
    let agent = Agent::new(config, Arc::new(registry), transport.clone()).expect("agent builds");
    agent
        .start_backends(&TaskMeta::root("test"))
        .await
        .expect("backends start");
    agent.manage_policies().await.expect("policies applied");

    Harness {
        agent,
        mock,
        transport,
    }
}

fn last_heartbeat(h: &Harness) -> serde_json::Value {
    let payloads = h.transport.published_on(&h.agent.topics().heartbeat);
    let last = payloads.last().expect("a heartbeat was published");
    serde_json::from_slice(last).expect("heartbeat is JSON")
}

#[tokio::test]
async fn test_offline_heartbeat_reports_everything_offline() {
    let h = started(MockBackend::running()).await;

    let outcome = h.agent.send_heartbeat(AgentState::Offline).await;
    assert!(outcome.published);
    assert!(outcome.restarts.is_empty());

    let hb = last_heartbeat(&h);
    assert_eq!(hb["state"], "offline");
    assert_eq!(hb["schema_version"], "1.0");
    assert_eq!(hb["backend_state"]["mock"]["state"], "offline");

    let policies = hb["policy_state"].as_object().unwrap();
    assert_eq!(policies.len(), 1);
    for policy in policies.values() {
        assert_eq!(policy["state"], "offline");
    }
    // offline reporting never polls the backend
    assert_eq!(h.mock.calls().status, 0);
}

#[tokio::test]
async fn test_healthy_backend_reports_running() {
    let h = started(MockBackend::running()).await;

    let outcome = h.agent.send_heartbeat(AgentState::Online).await;
    assert!(outcome.restarts.is_empty());

    let hb = last_heartbeat(&h);
    assert_eq!(hb["state"], "online");
    assert_eq!(hb["backend_state"]["mock"]["state"], "running");

    let policy = hb["policy_state"].as_object().unwrap().values().next().unwrap().clone();
    assert_eq!(policy["name"], "p1");
    assert_eq!(policy["state"], "running");
    assert_eq!(policy["backend"], "mock");
    assert_eq!(policy["datasets"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unreachable_backend_marks_policies_unknown() {
    let h = started(MockBackend::running()).await;
    h.mock.set_status(RunningStatus::BackendError, Some("connection refused"));

    h.agent.send_heartbeat(AgentState::Online).await;

    let hb = last_heartbeat(&h);
    assert_eq!(hb["backend_state"]["mock"]["state"], "backend_error");
    assert_eq!(hb["backend_state"]["mock"]["error"], "connection refused");
    let policy = hb["policy_state"].as_object().unwrap().values().next().unwrap().clone();
    assert_eq!(policy["state"], "unknown");
    assert_eq!(policy["error"], "backend is unreachable");
}

#[tokio::test]
async fn test_no_restart_within_cooldown() {
    let h = started(MockBackend::erroring("boom")).await;

    for _ in 0..3 {
        let outcome = h.agent.send_heartbeat(AgentState::Online).await;
        assert!(outcome.restarts.is_empty());
    }

    assert_eq!(h.mock.calls().full_reset, 0);
    assert_eq!(h.agent.backend_state("mock").await.unwrap().restart_count, 0);
}

#[tokio::test]
async fn test_erroring_backend_restarted_once_past_cooldown() {
    let mock = MockBackend::erroring("boom");
    mock.pin_start_time(Utc::now() - chrono::Duration::minutes(10));
    let h = started(mock).await;
    assert_eq!(h.agent.backend_state("mock").await.unwrap().restart_count, 0);

    let outcome = h.agent.send_heartbeat(AgentState::Online).await;
    assert_eq!(outcome.restarts.len(), 1);
    for restart in outcome.restarts {
        restart.await.unwrap();
    }

    let state = h.agent.backend_state("mock").await.unwrap();
    assert_eq!(state.restart_count, 1);
    assert_eq!(state.last_restart_reason.as_deref(), Some("failed during heartbeat"));
    assert!(state.last_restart_ts.is_some());
    assert_eq!(h.mock.calls().full_reset, 1);

    // policies were purged and re-applied from local configuration
    let policies = h.agent.policy_manager().policy_state().await.unwrap();
    assert_eq!(policies.len(), 1);
    assert_eq!(policies[0].name, "p1");
}

#[tokio::test]
async fn test_in_flight_restart_suppresses_another() {
    let mock = MockBackend::erroring("boom");
    mock.pin_start_time(Utc::now() - chrono::Duration::minutes(10));
    mock.set_reset_delay(Duration::from_millis(300));
    let h = started(mock).await;

    let first = h.agent.send_heartbeat(AgentState::Online).await;
    assert_eq!(first.restarts.len(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = h.agent.send_heartbeat(AgentState::Online).await;
    assert!(second.restarts.is_empty());

    for restart in first.restarts {
        restart.await.unwrap();
    }
    assert_eq!(h.agent.backend_state("mock").await.unwrap().restart_count, 1);
}

#[tokio::test]
async fn test_restarts_of_one_backend_are_serialized() {
    let mock = MockBackend::running();
    mock.set_reset_delay(Duration::from_millis(100));
    let h = started(mock).await;

    let begin = Instant::now();
    let (a, b) = tokio::join!(
        h.agent.restart_backend("mock", "first"),
        h.agent.restart_backend("mock", "second"),
    );
    a.unwrap();
    b.unwrap();

    assert!(begin.elapsed() >= Duration::from_millis(200));
    assert_eq!(h.mock.calls().full_reset, 2);
    assert_eq!(h.agent.backend_state("mock").await.unwrap().restart_count, 2);
}

#[tokio::test]
async fn test_disconnected_transport_still_checks_health() {
    let h = started(MockBackend::running()).await;
    h.transport.set_fail_publishes(true);

    let outcome = h.agent.send_heartbeat(AgentState::Online).await;
    assert!(!outcome.published);
    assert_eq!(h.mock.calls().status, 1);
    assert_eq!(
        h.agent.backend_state("mock").await.unwrap().status,
        RunningStatus::Running
    );
}
