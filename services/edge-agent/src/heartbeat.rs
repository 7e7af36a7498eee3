//! Heartbeat and health loop.
//!
//! A single task reports agent health on a fixed interval. Each tick runs an
//! explicit pipeline:
//!
//! 1. **snapshot**: poll every started backend's live status, sequentially,
//!    and record it into the agent's backend state
//! 2. **derive**: assemble the versioned [`Heartbeat`] record (pure)
//! 3. **restart decision**: unhealthy backends past the cool-down are
//!    restarted in the background (pure decision, spawned action)
//! 4. **publish**: send the record at at-least-once QoS, logging failures
//!
//! On cancellation the loop sends one final offline heartbeat and exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use crate::agent::{Agent, GroupInfo};
use crate::backend::{BackendState, RunningStatus};
use crate::comms::Qos;
use crate::policy::{PolicyData, PolicyState, BACKEND_UNREACHABLE};
use crate::task::TaskMeta;

/// Version of the heartbeat record layout.
pub const HEARTBEAT_SCHEMA_VERSION: &str = "1.0";

/// Reason recorded on restarts triggered by the health loop.
pub const HEALTH_RESTART_REASON: &str = "failed during heartbeat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub schema_version: String,
    pub state: AgentState,
    pub timestamp: DateTime<Utc>,
    pub backend_state: BTreeMap<String, BackendStateInfo>,
    pub policy_state: BTreeMap<String, PolicyStateInfo>,
    pub group_state: BTreeMap<String, GroupStateInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStateInfo {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub restart_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart_reason: Option<String>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyStateInfo {
    pub name: String,
    pub version: i32,
    pub state: PolicyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub datasets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scrape_ts: Option<DateTime<Utc>>,
    pub last_scrape_bytes: i64,
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStateInfo {
    pub name: String,
    pub channel: String,
}

/// One backend's row in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSnapshot {
    pub name: String,
    pub state: BackendState,
}

/// Result of the restart decision for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Healthy,
    Restart,
    /// Unhealthy but still inside the cool-down; wait this much longer.
    Wait(Duration),
}

/// What a single tick did. Restart handles let callers await the restarts
/// the tick spawned.
#[derive(Debug)]
pub struct HeartbeatOutcome {
    pub heartbeat: Heartbeat,
    pub published: bool,
    pub restarts: Vec<JoinHandle<()>>,
}

/// Reported state of a policy given the agent and backend state.
pub fn policy_report_state(
    agent: AgentState,
    backend: Option<RunningStatus>,
    stored: PolicyState,
) -> (PolicyState, Option<&'static str>) {
    if agent == AgentState::Offline {
        return (PolicyState::Offline, None);
    }
    match backend {
        Some(status) if status != RunningStatus::Running => {
            (PolicyState::Unknown, Some(BACKEND_UNREACHABLE))
        }
        _ => (stored, None),
    }
}

/// Assembles the heartbeat record. Pure.
pub fn derive_heartbeat(
    agent: AgentState,
    timestamp: DateTime<Utc>,
    backends: &[BackendSnapshot],
    policies: &[PolicyData],
    groups: &BTreeMap<String, GroupInfo>,
) -> Heartbeat {
    let backend_state = backends
        .iter()
        .map(|b| {
            let state = &b.state;
            let info = BackendStateInfo {
                state: state.status.to_string(),
                error: (state.status != RunningStatus::Running)
                    .then(|| state.last_error.clone())
                    .flatten(),
                last_error: state.last_error.clone(),
                last_restart_ts: state.last_restart_ts,
                restart_count: state.restart_count,
                last_restart_reason: state.last_restart_reason.clone(),
            };
            (b.name.clone(), info)
        })
        .collect();

    let statuses: HashMap<&str, RunningStatus> = backends
        .iter()
        .map(|b| (b.name.as_str(), b.state.status))
        .collect();

    let policy_state = policies
        .iter()
        .map(|p| {
            let (state, override_err) = policy_report_state(
                agent,
                statuses.get(p.backend.as_str()).copied(),
                p.state,
            );
            let info = PolicyStateInfo {
                name: p.name.clone(),
                version: p.version,
                state,
                error: override_err
                    .map(str::to_string)
                    .or_else(|| p.backend_err.clone()),
                datasets: p.dataset_ids().iter().map(ToString::to_string).collect(),
                last_scrape_ts: p.last_scrape_ts,
                last_scrape_bytes: p.last_scrape_bytes,
                backend: p.backend.clone(),
            };
            (p.id.to_string(), info)
        })
        .collect();

    let group_state = groups
        .iter()
        .map(|(id, g)| {
            (
                id.clone(),
                GroupStateInfo {
                    name: g.name.clone(),
                    channel: g.channel_id.clone(),
                },
            )
        })
        .collect();

    Heartbeat {
        schema_version: HEARTBEAT_SCHEMA_VERSION.to_string(),
        state: agent,
        timestamp,
        backend_state,
        policy_state,
        group_state,
    }
}

/// Whether an unhealthy backend is due for a restart. Pure.
///
/// A backend that never recorded a start time is due immediately.
pub fn restart_decision(
    status: RunningStatus,
    start_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> RestartDecision {
    if status == RunningStatus::Running {
        return RestartDecision::Healthy;
    }
    let Some(started) = start_time else {
        return RestartDecision::Restart;
    };
    let elapsed = (now - started).to_std().unwrap_or(Duration::ZERO);
    if elapsed >= cooldown {
        RestartDecision::Restart
    } else {
        RestartDecision::Wait(cooldown - elapsed)
    }
}

impl Agent {
    /// Polls every started backend and records the result. With the agent
    /// offline nothing is polled and every backend reads offline.
    pub(crate) async fn snapshot(&self, agent: AgentState) -> Vec<BackendSnapshot> {
        let backends = self.started_backends().await;
        let mut rows = Vec::with_capacity(backends.len());

        for (name, backend) in backends {
            if agent == AgentState::Offline {
                let recorded = self.backend_state(&name).await.unwrap_or_default();
                rows.push(BackendSnapshot {
                    name,
                    state: BackendState {
                        status: RunningStatus::Offline,
                        ..recorded
                    },
                });
                continue;
            }

            let report = backend.running_status().await;
            let mut states = self.backend_states.write().await;
            let state = states.entry(name.clone()).or_default();
            state.status = report.status;
            if report.status != RunningStatus::Running {
                error!(
                    backend = %name,
                    status = %report.status,
                    detail = report.message.as_deref().unwrap_or_default(),
                    "backend not ready"
                );
                if let Some(err) = &report.error {
                    state.last_error = Some(format!("failed to retrieve backend status: {err}"));
                } else if let Some(message) = report.message.as_ref().filter(|m| !m.is_empty()) {
                    state.last_error = Some(message.clone());
                }
            }
            rows.push(BackendSnapshot {
                name,
                state: state.clone(),
            });
        }
        rows
    }

    /// Runs one full tick of the pipeline.
    pub async fn send_heartbeat(self: &Arc<Self>, agent: AgentState) -> HeartbeatOutcome {
        let now = Utc::now();
        debug!(state = ?agent, "heartbeat");

        let backends = self.snapshot(agent).await;
        let policies = match self.policy_manager.policy_state().await {
            Ok(policies) => policies,
            Err(e) => {
                error!(error = %e, "unable to retrieve policy state");
                Vec::new()
            }
        };
        let groups = self.group_snapshot().await;
        let heartbeat = derive_heartbeat(agent, now, &backends, &policies, &groups);

        let mut restarts = Vec::new();
        if agent == AgentState::Online {
            for row in &backends {
                let start_time = self
                    .started_backend(&row.name)
                    .await
                    .and_then(|b| b.start_time());
                match restart_decision(row.state.status, start_time, now, self.restart_cooldown) {
                    RestartDecision::Healthy => {}
                    RestartDecision::Restart => {
                        info!(backend = %row.name, "attempting backend restart due to failed status during heartbeat");
                        if let Some(handle) = self.spawn_restart(&row.name, HEALTH_RESTART_REASON) {
                            restarts.push(handle);
                        }
                    }
                    RestartDecision::Wait(remaining) => {
                        info!(
                            backend = %row.name,
                            remaining_secs = remaining.as_secs(),
                            "waiting to attempt backend restart due to failed status"
                        );
                    }
                }
            }
        }

        let published = self.publish_heartbeat(&heartbeat).await;
        HeartbeatOutcome {
            heartbeat,
            published,
            restarts,
        }
    }

    async fn publish_heartbeat(&self, heartbeat: &Heartbeat) -> bool {
        if !self.transport.is_connected() {
            debug!("transport not connected, heartbeat not published");
            return false;
        }
        let body = match serde_json::to_vec(heartbeat) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "error marshalling heartbeat");
                return false;
            }
        };
        match self
            .transport
            .publish(&self.topics.heartbeat, Qos::AtLeastOnce, body)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "error sending heartbeat");
                false
            }
        }
    }

    /// Fires once immediately, then every interval until `cancel` fires.
    pub(crate) async fn run_heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let task = self
            .config_manager
            .task_context(&TaskMeta::root("heartbeat"));
        let span = task.span();

        async move {
            debug!("start heartbeats routine");
            let period = self.heartbeat_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            self.send_heartbeat(AgentState::Online).await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("heartbeat scope cancelled, going offline");
                        self.send_heartbeat(AgentState::Offline).await;
                        break;
                    }
                    _ = ticker.tick() => {
                        self.send_heartbeat(AgentState::Online).await;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
