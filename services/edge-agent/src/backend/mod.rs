//! Pluggable data-collection backends.
//!
//! Every backend satisfies [`Backend`]. The agent owns started backends as
//! `Arc<dyn Backend>` and only ever talks to them through the trait: it
//! configures and starts them in declaration order, polls
//! [`Backend::running_status`] from the heartbeat, and recycles them with
//! [`Backend::full_reset`] when they stay unhealthy.
//!
//! ## Modules
//!
//! - `api`: HTTP client for a backend's local control surface
//! - `process`: generic process-backed backend (spawn, readiness, control)
//! - `mock`: scriptable backend for tests and local development
//! - `registry`: name to backend lookup table

pub mod api;
mod mock;
mod process;
mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edge_id::AgentId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::comms::Transport;
use crate::policy::{PolicyData, SharedPolicyRepo};
use crate::task::TaskMeta;

pub use api::{ApiError, ControlSurfaceClient};
pub use mock::{MockBackend, MockCalls};
pub use process::{ArgStyle, ProcessBackend, ProcessBackendSpec, ProcessConfig};
pub use registry::BackendRegistry;

/// Backend-specific configuration block, passed through untouched.
pub type RawBackendConfig = serde_yaml::Value;

/// Runtime status of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RunningStatus {
    /// Not yet polled.
    #[default]
    Unknown,
    /// Process alive and control surface reachable.
    Running,
    /// Process alive but control surface unreachable or erroring.
    BackendError,
    AgentError,
    /// Process confirmed exited. Terminal until an explicit restart.
    Offline,
    /// Healthy but idle, no policy attached yet.
    Waiting,
}

impl RunningStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunningStatus::Unknown => "unknown",
            RunningStatus::Running => "running",
            RunningStatus::BackendError => "backend_error",
            RunningStatus::AgentError => "agent_error",
            RunningStatus::Offline => "offline",
            RunningStatus::Waiting => "waiting",
        }
    }
}

impl fmt::Display for RunningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RunningStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Result of a live status query.
#[derive(Debug)]
pub struct StatusReport {
    pub status: RunningStatus,
    pub message: Option<String>,
    pub error: Option<BackendError>,
}

impl StatusReport {
    pub fn running() -> Self {
        Self {
            status: RunningStatus::Running,
            message: None,
            error: None,
        }
    }

    pub fn new(status: RunningStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            error: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: BackendError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Mutable per-backend record kept by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendState {
    pub status: RunningStatus,
    pub restart_count: u64,
    pub last_error: Option<String>,
    pub last_restart_ts: Option<DateTime<Utc>>,
    pub last_restart_reason: Option<String>,
}

impl BackendState {
    pub fn seeded(status: RunningStatus) -> Self {
        Self {
            status,
            last_restart_ts: Some(Utc::now()),
            ..Default::default()
        }
    }
}

/// Settings shared by every backend, taken from the reserved `common` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackendCommons {
    pub otel: OtelCommons,
    pub diode: DiodeCommons,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OtelCommons {
    pub host: String,
    pub port: u16,
    pub agent_tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiodeCommons {
    pub target: String,
    pub api_key: String,
    pub agent_name: String,
}

/// Errors raised by backends.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid backend configuration: {0}")]
    Config(String),

    #[error("backend not configured")]
    NotConfigured,

    #[error("failed to spawn {exec}: {source}")]
    Spawn {
        exec: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} process exited during startup, check log")]
    ExitedOnStartup(String),

    #[error("{kind} not ready after {attempts} attempts: {last_error}")]
    NotReady {
        kind: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{kind} process is not running ({status})")]
    NotRunning { kind: String, status: RunningStatus },

    #[error("process error: {0}")]
    Process(#[from] std::io::Error),

    #[error("control surface: {0}")]
    Api(#[from] ApiError),

    #[error("policy encoding failed: {0}")]
    Encode(String),

    #[error("startup cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Capability set every backend implements.
///
/// Methods take `&self`; implementations keep their runtime handle behind
/// interior mutability so the heartbeat can poll status while a restart is
/// in flight elsewhere.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Applies configuration. Called before every (re)start.
    async fn configure(
        &self,
        repo: SharedPolicyRepo,
        config: &RawBackendConfig,
        common: &BackendCommons,
    ) -> Result<(), BackendError>;

    /// Binds the transport the backend may publish its own data on.
    fn set_comms_client(&self, agent_id: AgentId, transport: Arc<dyn Transport>, base_topic: &str);

    async fn version(&self) -> Result<String, BackendError>;

    /// Starts the backend and blocks until it is ready or the bounded
    /// readiness check gives up. `cancel` scopes the backend's own tasks.
    async fn start(&self, task: &TaskMeta, cancel: CancellationToken) -> Result<(), BackendError>;

    /// Stops the backend and waits for process exit confirmation.
    async fn stop(&self, task: &TaskMeta) -> Result<(), BackendError>;

    /// Stop (if running) then start again.
    async fn full_reset(&self, task: &TaskMeta, cancel: CancellationToken) -> Result<(), BackendError>;

    /// When the current process was started, `None` if never started.
    fn start_time(&self) -> Option<DateTime<Utc>>;

    async fn capabilities(&self) -> Result<serde_json::Map<String, serde_json::Value>, BackendError>;

    /// Live status: liveness first, then control-surface reachability.
    async fn running_status(&self) -> StatusReport;

    fn initial_state(&self) -> RunningStatus;

    /// Applies a policy. On update the old version is removed first.
    async fn apply_policy(&self, data: &PolicyData, update: bool) -> Result<(), BackendError>;

    /// Removes a policy by the name the backend knows it under.
    async fn remove_policy(&self, data: &PolicyData) -> Result<(), BackendError>;
}
