//! Scriptable in-process backend.
//!
//! Reports whatever status it is told to, records every call, and can be
//! made to fail individual operations. Used by the agent's tests and by
//! `backends: {mock: {}}` configs for local development.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edge_id::{AgentId, PolicyId};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Backend, BackendCommons, BackendError, RawBackendConfig, RunningStatus, StatusReport};
use crate::comms::Transport;
use crate::policy::{PolicyData, PolicyError, SharedPolicyRepo};
use crate::task::TaskMeta;

/// Snapshot of how often each operation was called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub configure: u64,
    pub start: u64,
    pub stop: u64,
    pub full_reset: u64,
    pub apply: u64,
    pub remove: u64,
    pub status: u64,
}

#[derive(Default)]
struct Counters {
    configure: AtomicU64,
    start: AtomicU64,
    stop: AtomicU64,
    full_reset: AtomicU64,
    apply: AtomicU64,
    remove: AtomicU64,
    status: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::SeqCst);
}

pub struct MockBackend {
    status: Mutex<RunningStatus>,
    status_message: Mutex<Option<String>>,
    started: AtomicBool,
    fail_start: AtomicBool,
    fail_reset: AtomicBool,
    fail_apply: AtomicBool,
    pinned_start_time: Mutex<Option<DateTime<Utc>>>,
    start_time: Mutex<Option<DateTime<Utc>>>,
    reset_delay: Mutex<Duration>,
    repo: Mutex<Option<SharedPolicyRepo>>,
    agent_id: Mutex<Option<AgentId>>,
    applied: Mutex<Vec<(PolicyId, bool)>>,
    removed: Mutex<Vec<String>>,
    calls: Counters,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(RunningStatus::Running)
    }
}

impl MockBackend {
    /// Backend that reports `status` once started.
    pub fn new(status: RunningStatus) -> Self {
        Self {
            status: Mutex::new(status),
            status_message: Mutex::new(None),
            started: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_reset: AtomicBool::new(false),
            fail_apply: AtomicBool::new(false),
            pinned_start_time: Mutex::new(None),
            start_time: Mutex::new(None),
            reset_delay: Mutex::new(Duration::ZERO),
            repo: Mutex::new(None),
            agent_id: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            calls: Counters::default(),
        }
    }

    pub fn running() -> Self {
        Self::new(RunningStatus::Running)
    }

    /// Always reports `BackendError` with the given message.
    pub fn erroring(message: &str) -> Self {
        let backend = Self::new(RunningStatus::BackendError);
        backend.set_status(RunningStatus::BackendError, Some(message));
        backend
    }

    pub fn set_status(&self, status: RunningStatus, message: Option<&str>) {
        if let Ok(mut s) = self.status.lock() {
            *s = status;
        }
        if let Ok(mut m) = self.status_message.lock() {
            *m = message.map(str::to_string);
        }
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reset(&self, fail: bool) {
        self.fail_reset.store(fail, Ordering::SeqCst);
    }

    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    /// Every start and reset reports this start time instead of now.
    pub fn pin_start_time(&self, at: DateTime<Utc>) {
        if let Ok(mut pinned) = self.pinned_start_time.lock() {
            *pinned = Some(at);
        }
        if let Ok(mut current) = self.start_time.lock() {
            *current = Some(at);
        }
    }

    /// Makes `full_reset` take this long.
    pub fn set_reset_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.reset_delay.lock() {
            *d = delay;
        }
    }

    pub fn calls(&self) -> MockCalls {
        let c = &self.calls;
        MockCalls {
            configure: c.configure.load(Ordering::SeqCst),
            start: c.start.load(Ordering::SeqCst),
            stop: c.stop.load(Ordering::SeqCst),
            full_reset: c.full_reset.load(Ordering::SeqCst),
            apply: c.apply.load(Ordering::SeqCst),
            remove: c.remove.load(Ordering::SeqCst),
            status: c.status.load(Ordering::SeqCst),
        }
    }

    /// `(policy, was_update)` for every successful apply, oldest first.
    pub fn applied(&self) -> Vec<(PolicyId, bool)> {
        self.applied.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Names passed to `remove_policy`, oldest first.
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.agent_id.lock().ok().and_then(|a| *a)
    }

    /// Records scrape volume for a policy, as a collecting backend would.
    pub async fn record_scrape(&self, policy: &PolicyId, bytes: i64) -> Result<(), PolicyError> {
        let Some(repo) = self.repo.lock().ok().and_then(|r| r.clone()) else {
            return Ok(());
        };
        let mut repo = repo.write().await;
        let mut data = repo.get(policy)?;
        data.last_scrape_bytes = bytes;
        data.last_scrape_ts = Some(Utc::now());
        repo.update(data)
    }

    fn stamp_start(&self) {
        let at = self
            .pinned_start_time
            .lock()
            .ok()
            .and_then(|p| *p)
            .unwrap_or_else(Utc::now);
        if let Ok(mut current) = self.start_time.lock() {
            *current = Some(at);
        }
        self.started.store(true, Ordering::SeqCst);
    }

    fn current_status(&self) -> (RunningStatus, Option<String>) {
        let status = self.status.lock().map(|s| *s).unwrap_or_default();
        let message = self.status_message.lock().ok().and_then(|m| m.clone());
        (status, message)
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn configure(
        &self,
        repo: SharedPolicyRepo,
        _config: &RawBackendConfig,
        _common: &BackendCommons,
    ) -> Result<(), BackendError> {
        bump(&self.calls.configure);
        if let Ok(mut current) = self.repo.lock() {
            *current = Some(repo);
        }
        Ok(())
    }

    fn set_comms_client(&self, agent_id: AgentId, _transport: Arc<dyn Transport>, _base_topic: &str) {
        if let Ok(mut current) = self.agent_id.lock() {
            *current = Some(agent_id);
        }
    }

    async fn version(&self) -> Result<String, BackendError> {
        Ok("mock-1.0.0".to_string())
    }

    async fn start(&self, task: &TaskMeta, _cancel: CancellationToken) -> Result<(), BackendError> {
        bump(&self.calls.start);
        debug!(routine = %task.routine(), "mock backend start");
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(BackendError::Other("mock start failure".to_string()));
        }
        self.stamp_start();
        Ok(())
    }

    async fn stop(&self, _task: &TaskMeta) -> Result<(), BackendError> {
        bump(&self.calls.stop);
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn full_reset(&self, _task: &TaskMeta, _cancel: CancellationToken) -> Result<(), BackendError> {
        bump(&self.calls.full_reset);
        let delay = self.reset_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(BackendError::Other("mock reset failure".to_string()));
        }
        self.stamp_start();
        Ok(())
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time.lock().ok().and_then(|t| *t)
    }

    async fn capabilities(&self) -> Result<serde_json::Map<String, serde_json::Value>, BackendError> {
        let mut caps = serde_json::Map::new();
        caps.insert("mock".to_string(), serde_json::Value::Bool(true));
        Ok(caps)
    }

    async fn running_status(&self) -> StatusReport {
        bump(&self.calls.status);
        if !self.started.load(Ordering::SeqCst) {
            return StatusReport::new(RunningStatus::Unknown, "backend not started yet");
        }
        let (status, message) = self.current_status();
        StatusReport {
            status,
            message,
            error: None,
        }
    }

    fn initial_state(&self) -> RunningStatus {
        RunningStatus::Unknown
    }

    async fn apply_policy(&self, data: &PolicyData, update: bool) -> Result<(), BackendError> {
        bump(&self.calls.apply);
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(BackendError::Other(format!("mock rejected policy {}", data.name)));
        }
        if let Ok(mut applied) = self.applied.lock() {
            applied.push((data.id.clone(), update));
        }
        Ok(())
    }

    async fn remove_policy(&self, data: &PolicyData) -> Result<(), BackendError> {
        bump(&self.calls.remove);
        if let Ok(mut removed) = self.removed.lock() {
            removed.push(data.removal_name().to_string());
        }
        Ok(())
    }
}
