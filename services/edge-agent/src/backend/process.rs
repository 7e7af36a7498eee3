//! Process-backed backend.
//!
//! One implementation covers every backend that runs as a child process and
//! exposes the local HTTP control surface. Per-kind differences (executable,
//! default port, argument layout, status endpoint) live in
//! [`ProcessBackendSpec`].
//!
//! Startup follows the readiness check every such backend shares:
//!
//! 1. spawn the process with piped output forwarded to the log
//! 2. sleep a fixed grace interval, then check liveness (exit is fatal)
//! 3. poll the status endpoint with linear backoff (`attempt × step`) up to
//!    a bounded retry count; exhaustion kills the process and fails start

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edge_id::AgentId;
use serde::{Deserialize, Deserializer};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::api::{
    ControlSurfaceClient, APPLY_POLICY_TIMEOUT, CAPABILITIES_TIMEOUT, REMOVE_POLICY_TIMEOUT,
    VERSION_TIMEOUT,
};
use super::{
    Backend, BackendCommons, BackendError, RawBackendConfig, RunningStatus, StatusReport,
};
use crate::comms::Transport;
use crate::policy::{PolicyData, SharedPolicyRepo};
use crate::task::TaskMeta;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PROTOCOL: &str = "http";
const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(1);
const DEFAULT_READINESS_RETRIES: u32 = 10;
const DEFAULT_READINESS_STEP: Duration = Duration::from_secs(1);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How the command line of a backend kind is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgStyle {
    /// Only the configured extra arguments.
    Plain,
    /// `--host H --port P --diode-target T --diode-api-key K --diode-app-name-prefix N`
    Discovery,
    /// `-c <config_file>`
    ConfigFile,
    /// `--admin-api -l H -p P`
    Pktvisor,
}

/// Static description of one process backend kind.
#[derive(Debug, Clone)]
pub struct ProcessBackendSpec {
    pub kind: String,
    pub exec: String,
    pub port: u16,
    pub arg_style: ArgStyle,
    /// Endpoint used for version lookup and readiness.
    pub status_path: String,
    /// JSON pointer to the version string inside the status response.
    pub version_pointer: String,
    pub config_file: Option<String>,
}

impl ProcessBackendSpec {
    pub fn new(kind: impl Into<String>, exec: impl Into<String>, port: u16) -> Self {
        Self {
            kind: kind.into(),
            exec: exec.into(),
            port,
            arg_style: ArgStyle::Plain,
            status_path: "status".to_string(),
            version_pointer: "/version".to_string(),
            config_file: None,
        }
    }

    #[must_use]
    pub fn with_arg_style(mut self, style: ArgStyle) -> Self {
        self.arg_style = style;
        self
    }

    #[must_use]
    pub fn with_status(mut self, path: &str, version_pointer: &str) -> Self {
        self.status_path = path.to_string();
        self.version_pointer = version_pointer.to_string();
        self
    }

    #[must_use]
    pub fn with_config_file(mut self, path: &str) -> Self {
        self.config_file = Some(path.to_string());
        self
    }

    pub fn network_discovery() -> Self {
        Self::new("network_discovery", "network-discovery", 8073).with_arg_style(ArgStyle::Discovery)
    }

    pub fn device_discovery() -> Self {
        Self::new("device_discovery", "device-discovery", 8072)
            .with_arg_style(ArgStyle::ConfigFile)
            .with_config_file("/opt/edge/agent.yaml")
    }

    pub fn pktvisor() -> Self {
        Self::new("pktvisor", "pktvisord", 10853)
            .with_arg_style(ArgStyle::Pktvisor)
            .with_status("metrics/app", "/app/version")
    }
}

/// Backend-specific settings as they appear in the config file. Every field
/// is optional; gaps are filled from the [`ProcessBackendSpec`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ProcessOverrides {
    exec: Option<String>,
    args: Vec<String>,
    host: Option<String>,
    #[serde(deserialize_with = "port_from_number_or_string")]
    port: Option<u16>,
    protocol: Option<String>,
    config_file: Option<String>,
    startup_grace_ms: Option<u64>,
    readiness_retries: Option<u32>,
    readiness_step_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
}

fn port_from_number_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u16>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }
    match Option::<Port>::deserialize(d)? {
        None => Ok(None),
        Some(Port::Number(p)) => Ok(Some(p)),
        Some(Port::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {s}"))),
    }
}

/// Resolved configuration of a process backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub exec: String,
    pub args: Vec<String>,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub config_file: Option<String>,
    pub startup_grace: Duration,
    pub readiness_retries: u32,
    pub readiness_step: Duration,
    pub stop_timeout: Duration,
}

impl ProcessConfig {
    /// Resolves a raw config block against the kind's defaults.
    pub fn resolve(spec: &ProcessBackendSpec, raw: &RawBackendConfig) -> Result<Self, BackendError> {
        let overrides: ProcessOverrides = if raw.is_null() {
            ProcessOverrides::default()
        } else {
            serde_yaml::from_value(raw.clone())
                .map_err(|e| BackendError::Config(format!("{}: {e}", spec.kind)))?
        };

        Ok(Self {
            exec: overrides.exec.unwrap_or_else(|| spec.exec.clone()),
            args: overrides.args,
            host: overrides.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: overrides.port.unwrap_or(spec.port),
            protocol: overrides
                .protocol
                .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            config_file: overrides.config_file.or_else(|| spec.config_file.clone()),
            startup_grace: overrides
                .startup_grace_ms
                .map_or(DEFAULT_STARTUP_GRACE, Duration::from_millis),
            readiness_retries: overrides
                .readiness_retries
                .unwrap_or(DEFAULT_READINESS_RETRIES),
            readiness_step: overrides
                .readiness_step_ms
                .map_or(DEFAULT_READINESS_STEP, Duration::from_millis),
            stop_timeout: overrides
                .stop_timeout_ms
                .map_or(DEFAULT_STOP_TIMEOUT, Duration::from_millis),
        })
    }

    /// Full command line arguments for the given layout.
    pub fn command_args(&self, style: ArgStyle, common: &BackendCommons) -> Vec<String> {
        let mut args: Vec<String> = match style {
            ArgStyle::Plain => Vec::new(),
            ArgStyle::Discovery => vec![
                "--host".into(),
                self.host.clone(),
                "--port".into(),
                self.port.to_string(),
                "--diode-target".into(),
                common.diode.target.clone(),
                "--diode-api-key".into(),
                common.diode.api_key.clone(),
                "--diode-app-name-prefix".into(),
                common.diode.agent_name.clone(),
            ],
            ArgStyle::ConfigFile => match &self.config_file {
                Some(path) => vec!["-c".into(), path.clone()],
                None => Vec::new(),
            },
            ArgStyle::Pktvisor => vec![
                "--admin-api".into(),
                "-l".into(),
                self.host.clone(),
                "-p".into(),
                self.port.to_string(),
            ],
        };
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Environment handed to the child so it can reach the shared sinks.
fn common_env(common: &BackendCommons, metrics_topic: Option<&str>) -> Vec<(String, String)> {
    let mut env = vec![
        ("EDGE_OTEL_HOST".to_string(), common.otel.host.clone()),
        ("EDGE_OTEL_PORT".to_string(), common.otel.port.to_string()),
        ("EDGE_DIODE_TARGET".to_string(), common.diode.target.clone()),
        ("EDGE_DIODE_AGENT_NAME".to_string(), common.diode.agent_name.clone()),
    ];
    if !common.otel.agent_tags.is_empty() {
        let tags: Vec<String> = common
            .otel
            .agent_tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env.push(("EDGE_AGENT_TAGS".to_string(), tags.join(",")));
    }
    if let Some(topic) = metrics_topic {
        env.push(("EDGE_METRICS_TOPIC".to_string(), topic.to_string()));
    }
    env
}

struct Configured {
    config: ProcessConfig,
    client: ControlSurfaceClient,
    args: Vec<String>,
    common: BackendCommons,
}

enum ProcState {
    NotStarted,
    Running { child: Child, pid: Option<u32> },
    Stopping,
    Exited { status: Option<ExitStatus> },
    Failed(String),
}

/// Child-process backend with a local HTTP control surface.
pub struct ProcessBackend {
    spec: ProcessBackendSpec,
    configured: Mutex<Option<Arc<Configured>>>,
    proc: Mutex<ProcState>,
    start_time: Mutex<Option<DateTime<Utc>>>,
    scope: Mutex<Option<CancellationToken>>,
    metrics_topic: Mutex<Option<String>>,
}

impl ProcessBackend {
    pub fn new(spec: ProcessBackendSpec) -> Self {
        Self {
            spec,
            configured: Mutex::new(None),
            proc: Mutex::new(ProcState::NotStarted),
            start_time: Mutex::new(None),
            scope: Mutex::new(None),
            metrics_topic: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> &str {
        &self.spec.kind
    }

    pub fn pid(&self) -> Option<u32> {
        match &*self.proc.lock().ok()? {
            ProcState::Running { pid, .. } => *pid,
            _ => None,
        }
    }

    fn configured(&self) -> Result<Arc<Configured>, BackendError> {
        self.configured
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .ok_or(BackendError::NotConfigured)
    }

    /// Liveness only: does the process exist and has it not exited.
    fn liveness(&self) -> StatusReport {
        let Ok(mut proc) = self.proc.lock() else {
            return StatusReport::new(RunningStatus::AgentError, "process table poisoned");
        };

        let exited = match &mut *proc {
            ProcState::NotStarted => {
                return StatusReport::new(RunningStatus::Unknown, "backend not started yet")
            }
            ProcState::Stopping | ProcState::Exited { .. } => {
                return StatusReport::new(
                    RunningStatus::Offline,
                    format!("{} process ended", self.spec.kind),
                )
            }
            ProcState::Failed(message) => {
                return StatusReport::new(
                    RunningStatus::BackendError,
                    format!("{} process error: {message}", self.spec.kind),
                )
            }
            ProcState::Running { child, .. } => match child.try_wait() {
                Ok(None) => return StatusReport::running(),
                Ok(Some(status)) => status,
                Err(e) => {
                    let message = format!("{} process error: {e}", self.spec.kind);
                    *proc = ProcState::Failed(e.to_string());
                    return StatusReport::new(RunningStatus::BackendError, message)
                        .with_error(BackendError::Process(e));
                }
            },
        };

        info!(backend = %self.spec.kind, status = %exited, "backend process exited");
        *proc = ProcState::Exited {
            status: Some(exited),
        };
        StatusReport::new(
            RunningStatus::Offline,
            format!("{} process ended", self.spec.kind),
        )
    }

    /// Control-surface calls are skipped unless the process is alive.
    fn ensure_running(&self) -> Result<Arc<Configured>, BackendError> {
        let configured = self.configured()?;
        let report = self.liveness();
        if report.status != RunningStatus::Running {
            warn!(
                backend = %self.spec.kind,
                status = %report.status,
                "skipping control surface request, process is not running"
            );
            return Err(BackendError::NotRunning {
                kind: self.spec.kind.clone(),
                status: report.status,
            });
        }
        Ok(configured)
    }

    async fn fetch_version(&self, configured: &Configured) -> Result<String, BackendError> {
        let body = configured
            .client
            .get_json(&self.spec.status_path, VERSION_TIMEOUT)
            .await?;
        Ok(body
            .pointer(&self.spec.version_pointer)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    fn spawn(&self, configured: &Configured, scope: &CancellationToken) -> Result<(), BackendError> {
        let config = &configured.config;
        let metrics_topic = self.metrics_topic.lock().ok().and_then(|t| t.clone());

        info!(
            backend = %self.spec.kind,
            exec = %config.exec,
            arguments = ?configured.args,
            "backend startup"
        );

        let mut child = Command::new(&config.exec)
            .args(&configured.args)
            .envs(common_env(&configured.common, metrics_topic.as_deref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                exec: config.exec.clone(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(self.spec.kind.clone(), "stdout", stdout, scope.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(self.spec.kind.clone(), "stderr", stderr, scope.clone()));
        }

        let pid = child.id();
        if let Ok(mut proc) = self.proc.lock() {
            *proc = ProcState::Running { child, pid };
        }
        if let Ok(mut current) = self.scope.lock() {
            *current = Some(scope.clone());
        }
        Ok(())
    }

    async fn await_readiness(
        &self,
        configured: &Configured,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let config = &configured.config;
        let mut last_error = String::from("no attempt made");

        for attempt in 0..config.readiness_retries {
            match self.fetch_version(configured).await {
                Ok(version) => {
                    info!(backend = %self.spec.kind, version = %version, "backend readiness ok");
                    return Ok(());
                }
                Err(e) => last_error = e.to_string(),
            }
            if attempt + 1 >= config.readiness_retries {
                break;
            }

            let backoff = config.readiness_step * attempt;
            debug!(
                backend = %self.spec.kind,
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                "backend not ready, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        Err(BackendError::NotReady {
            kind: self.spec.kind.clone(),
            attempts: config.readiness_retries,
            last_error,
        })
    }

    /// Kills the child and waits, bounded, for its exit.
    async fn terminate(&self, timeout: Duration) -> Result<Option<ExitStatus>, BackendError> {
        let taken = match self.proc.lock() {
            Ok(mut proc) => std::mem::replace(&mut *proc, ProcState::Stopping),
            Err(_) => return Err(BackendError::Other("process table poisoned".to_string())),
        };

        let result = match taken {
            ProcState::Running { mut child, pid } => {
                if let Err(e) = child.start_kill() {
                    warn!(backend = %self.spec.kind, pid = ?pid, error = %e, "failed to signal process");
                }
                match tokio::time::timeout(timeout, child.wait()).await {
                    Ok(Ok(status)) => Ok(Some(status)),
                    Ok(Err(e)) => Err(BackendError::Process(e)),
                    Err(_) => Err(BackendError::Other(format!(
                        "{} did not exit within {}s",
                        self.spec.kind,
                        timeout.as_secs()
                    ))),
                }
            }
            ProcState::Exited { status } => Ok(status),
            ProcState::NotStarted | ProcState::Stopping | ProcState::Failed(_) => Ok(None),
        };

        if let Ok(mut proc) = self.proc.lock() {
            *proc = ProcState::Exited {
                status: result.as_ref().ok().copied().flatten(),
            };
        }
        if let Some(scope) = self.scope.lock().ok().and_then(|mut s| s.take()) {
            scope.cancel();
        }
        result
    }
}

async fn forward_lines<R>(kind: String, stream: &'static str, reader: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => info!(backend = %kind, stream, log = %line, "backend output"),
                Ok(None) => break,
                Err(e) => {
                    debug!(backend = %kind, stream, error = %e, "backend output closed");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    async fn configure(
        &self,
        _repo: SharedPolicyRepo,
        config: &RawBackendConfig,
        common: &BackendCommons,
    ) -> Result<(), BackendError> {
        let config = ProcessConfig::resolve(&self.spec, config)?;
        let client = ControlSurfaceClient::new(&config.protocol, &config.host, config.port)?;
        let args = config.command_args(self.spec.arg_style, common);

        debug!(backend = %self.spec.kind, base_url = %client.base_url(), "backend configured");
        let configured = Arc::new(Configured {
            config,
            client,
            args,
            common: common.clone(),
        });
        if let Ok(mut current) = self.configured.lock() {
            *current = Some(configured);
        }
        Ok(())
    }

    fn set_comms_client(&self, agent_id: AgentId, _transport: Arc<dyn Transport>, base_topic: &str) {
        let shard = agent_id.ulid().to_string().chars().next().unwrap_or('0');
        let topic = format!("{}/m/{shard}", base_topic.replacen('?', "otlp", 1));
        if let Ok(mut current) = self.metrics_topic.lock() {
            *current = Some(topic);
        }
    }

    async fn version(&self) -> Result<String, BackendError> {
        let configured = self.ensure_running()?;
        self.fetch_version(&configured).await
    }

    async fn start(&self, task: &TaskMeta, cancel: CancellationToken) -> Result<(), BackendError> {
        let configured = self.configured()?;
        let scope = cancel.child_token();
        info!(backend = %self.spec.kind, routine = %task.routine(), "starting backend");

        // every attempt arms the restart cool-down, including failed spawns
        if let Ok(mut start_time) = self.start_time.lock() {
            *start_time = Some(Utc::now());
        }
        self.spawn(&configured, &scope)?;

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = self.terminate(configured.config.stop_timeout).await;
                return Err(BackendError::Cancelled);
            }
            _ = tokio::time::sleep(configured.config.startup_grace) => {}
        }

        let report = self.liveness();
        if report.status != RunningStatus::Running {
            error!(
                backend = %self.spec.kind,
                status = %report.status,
                detail = report.message.as_deref().unwrap_or_default(),
                "backend startup error"
            );
            let _ = self.terminate(configured.config.stop_timeout).await;
            return Err(BackendError::ExitedOnStartup(self.spec.kind.clone()));
        }
        info!(backend = %self.spec.kind, pid = ?self.pid(), "backend process started");

        if let Err(e) = self.await_readiness(&configured, &cancel).await {
            error!(backend = %self.spec.kind, error = %e, "backend readiness failed");
            if let Err(stop_err) = self.terminate(configured.config.stop_timeout).await {
                error!(backend = %self.spec.kind, error = %stop_err, "failed to stop unready backend");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn stop(&self, task: &TaskMeta) -> Result<(), BackendError> {
        info!(backend = %self.spec.kind, routine = %task.routine(), "routine call to stop backend");
        let timeout = self
            .configured()
            .map(|c| c.config.stop_timeout)
            .unwrap_or(DEFAULT_STOP_TIMEOUT);

        match self.terminate(timeout).await {
            Ok(status) => {
                info!(
                    backend = %self.spec.kind,
                    exit_code = ?status.and_then(|s| s.code()),
                    "backend process stopped"
                );
                Ok(())
            }
            Err(e) => {
                error!(backend = %self.spec.kind, error = %e, "backend shutdown error");
                Err(e)
            }
        }
    }

    async fn full_reset(&self, task: &TaskMeta, cancel: CancellationToken) -> Result<(), BackendError> {
        if self.liveness().status == RunningStatus::Running {
            self.stop(task).await?;
        }
        self.start(&task.with_routine(&self.spec.kind), cancel).await
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time.lock().ok().and_then(|t| *t)
    }

    async fn capabilities(&self) -> Result<serde_json::Map<String, serde_json::Value>, BackendError> {
        let configured = self.ensure_running()?;
        match configured
            .client
            .get_json("capabilities", CAPABILITIES_TIMEOUT)
            .await?
        {
            serde_json::Value::Object(map) => Ok(map),
            serde_json::Value::Null => Ok(serde_json::Map::new()),
            other => Err(BackendError::Other(format!(
                "capabilities response is not an object: {other}"
            ))),
        }
    }

    async fn running_status(&self) -> StatusReport {
        let report = self.liveness();
        if report.status != RunningStatus::Running {
            return report;
        }

        let configured = match self.configured() {
            Ok(c) => c,
            Err(e) => {
                return StatusReport::new(RunningStatus::AgentError, e.to_string()).with_error(e)
            }
        };
        match self.fetch_version(&configured).await {
            Ok(_) => StatusReport::running(),
            Err(e) => StatusReport::new(
                RunningStatus::BackendError,
                "process running, REST API unavailable",
            )
            .with_error(e),
        }
    }

    fn initial_state(&self) -> RunningStatus {
        RunningStatus::Unknown
    }

    async fn apply_policy(&self, data: &PolicyData, update: bool) -> Result<(), BackendError> {
        if update {
            if let Err(e) = self.remove_policy(data).await {
                warn!(
                    backend = %self.spec.kind,
                    policy_id = %data.id,
                    policy_name = %data.name,
                    error = %e,
                    "policy failed to remove"
                );
            }
        }

        let configured = self.ensure_running()?;
        let body = policy_document(data)?;
        debug!(backend = %self.spec.kind, policy_id = %data.id, "policy apply");

        configured
            .client
            .post_yaml("policies", body, APPLY_POLICY_TIMEOUT)
            .await
            .map_err(|e| {
                warn!(backend = %self.spec.kind, policy_id = %data.id, error = %e, "policy application failure");
                BackendError::Api(e)
            })?;
        Ok(())
    }

    async fn remove_policy(&self, data: &PolicyData) -> Result<(), BackendError> {
        let configured = self.ensure_running()?;
        debug!(backend = %self.spec.kind, policy_id = %data.id, name = %data.removal_name(), "policy remove");
        configured
            .client
            .delete(
                &format!("policies/{}", data.removal_name()),
                REMOVE_POLICY_TIMEOUT,
            )
            .await?;
        Ok(())
    }
}

/// YAML body `{policies: {<name>: <data>}}`.
fn policy_document(data: &PolicyData) -> Result<String, BackendError> {
    let payload =
        serde_yaml::to_value(&data.data).map_err(|e| BackendError::Encode(e.to_string()))?;
    let mut policies = BTreeMap::new();
    policies.insert(data.name.clone(), payload);
    let mut document = BTreeMap::new();
    document.insert("policies", policies);
    serde_yaml::to_string(&document).map_err(|e| BackendError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{MemPolicyRepo, PolicyTransition};
    use edge_id::PolicyId;
    use tokio::sync::RwLock;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn repo() -> SharedPolicyRepo {
        Arc::new(RwLock::new(MemPolicyRepo::new()))
    }

    fn fast_config(exec: &str, args: &[&str], port: u16) -> RawBackendConfig {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        serde_yaml::to_value(serde_json::json!({
            "exec": exec,
            "args": args,
            "host": "127.0.0.1",
            "port": port,
            "startup_grace_ms": 50,
            "readiness_retries": 3,
            "readiness_step_ms": 20,
            "stop_timeout_ms": 2000,
        }))
        .unwrap()
    }

    fn plain_spec() -> ProcessBackendSpec {
        ProcessBackendSpec::new("test", "sleep", 1)
    }

    async fn status_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": "0.9.0"})))
            .mount(&server)
            .await;
        server
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_resolve_defaults() {
        let spec = ProcessBackendSpec::network_discovery();
        let config = ProcessConfig::resolve(&spec, &serde_yaml::Value::Null).unwrap();

        assert_eq!(config.exec, "network-discovery");
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8073);
        assert_eq!(config.protocol, "http");
        assert_eq!(config.readiness_retries, 10);
    }

    #[test]
    fn test_resolve_port_as_string() {
        let spec = ProcessBackendSpec::pktvisor();
        let raw: RawBackendConfig = serde_yaml::from_str("host: 0.0.0.0\nport: \"10900\"\n").unwrap();
        let config = ProcessConfig::resolve(&spec, &raw).unwrap();
        assert_eq!(config.port, 10900);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn test_resolve_rejects_bad_port() {
        let raw: RawBackendConfig = serde_yaml::from_str("port: nope\n").unwrap();
        let err = ProcessConfig::resolve(&plain_spec(), &raw).unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));
    }

    #[test]
    fn test_discovery_args() {
        let spec = ProcessBackendSpec::network_discovery();
        let config = ProcessConfig::resolve(&spec, &serde_yaml::Value::Null).unwrap();
        let mut common = BackendCommons::default();
        common.diode.target = "grpc://diode:8080".to_string();

        let args = config.command_args(spec.arg_style, &common);
        assert_eq!(&args[..4], ["--host", "localhost", "--port", "8073"]);
        assert!(args.contains(&"grpc://diode:8080".to_string()));
    }

    #[test]
    fn test_config_file_args() {
        let spec = ProcessBackendSpec::device_discovery();
        let config = ProcessConfig::resolve(&spec, &serde_yaml::Value::Null).unwrap();
        let args = config.command_args(spec.arg_style, &BackendCommons::default());
        assert_eq!(args, ["-c", "/opt/edge/agent.yaml"]);
    }

    #[test]
    fn test_policy_document_layout() {
        let data = PolicyData::new(
            PolicyId::new(),
            "p1",
            "pktvisor",
            1,
            serde_json::json!({"kind": "collection", "input": {"tap": "default"}}),
        );
        let yaml = policy_document(&data).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["policies"]["p1"]["kind"].as_str(), Some("collection"));
    }

    #[tokio::test]
    async fn test_not_started_is_unknown() {
        let backend = ProcessBackend::new(plain_spec());
        let report = backend.running_status().await;
        assert_eq!(report.status, RunningStatus::Unknown);
        assert!(backend.start_time().is_none());
    }

    #[tokio::test]
    async fn test_start_requires_configure() {
        let backend = ProcessBackend::new(plain_spec());
        let err = backend
            .start(&TaskMeta::root("test"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotConfigured));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let backend = ProcessBackend::new(plain_spec());
        backend
            .configure(repo(), &fast_config("/nonexistent/edge-backend", &[], 1), &BackendCommons::default())
            .await
            .unwrap();
        let err = backend
            .start(&TaskMeta::root("test"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_failed_respawn_arms_cooldown() {
        use crate::heartbeat::{restart_decision, RestartDecision};

        let backend = ProcessBackend::new(plain_spec());
        backend
            .configure(repo(), &fast_config("/nonexistent/edge-backend", &[], 1), &BackendCommons::default())
            .await
            .unwrap();

        let err = backend
            .full_reset(&TaskMeta::root("test"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));

        let started = backend.start_time().expect("start attempt recorded");
        let now = Utc::now();
        assert!(now - started < chrono::Duration::seconds(5));

        let status = backend.running_status().await.status;
        assert_ne!(status, RunningStatus::Running);
        let decision = restart_decision(status, backend.start_time(), now, Duration::from_secs(300));
        assert!(matches!(decision, RestartDecision::Wait(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_readiness_gives_up_without_trailing_backoff() {
        let backend = ProcessBackend::new(plain_spec());
        let raw = serde_yaml::to_value(serde_json::json!({
            "exec": "sleep",
            "args": ["30"],
            "host": "127.0.0.1",
            "port": unused_port(),
            "startup_grace_ms": 50,
            "readiness_retries": 2,
            "readiness_step_ms": 3000,
            "stop_timeout_ms": 2000,
        }))
        .unwrap();
        backend.configure(repo(), &raw, &BackendCommons::default()).await.unwrap();

        let begin = std::time::Instant::now();
        let err = backend
            .start(&TaskMeta::root("test"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotReady { attempts: 2, .. }));
        // first backoff is zero, the final attempt does not sleep
        assert!(begin.elapsed() < Duration::from_millis(2500));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_during_startup_fails() {
        let backend = ProcessBackend::new(plain_spec());
        backend
            .configure(repo(), &fast_config("true", &[], unused_port()), &BackendCommons::default())
            .await
            .unwrap();

        let err = backend
            .start(&TaskMeta::root("test"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ExitedOnStartup(_)));
        assert_eq!(backend.running_status().await.status, RunningStatus::Offline);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_readiness_exhaustion_kills_process() {
        let backend = ProcessBackend::new(plain_spec());
        backend
            .configure(repo(), &fast_config("sleep", &["30"], unused_port()), &BackendCommons::default())
            .await
            .unwrap();

        let err = backend
            .start(&TaskMeta::root("test"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotReady { attempts: 3, .. }));
        assert!(backend.pid().is_none());
        assert_eq!(backend.running_status().await.status, RunningStatus::Offline);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_running_requires_liveness_and_control_surface() {
        let server = status_server().await;
        let backend = ProcessBackend::new(plain_spec());
        backend
            .configure(
                repo(),
                &fast_config("sleep", &["30"], server.address().port()),
                &BackendCommons::default(),
            )
            .await
            .unwrap();
        backend
            .start(&TaskMeta::root("test"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backend.running_status().await.status, RunningStatus::Running);
        assert_eq!(backend.version().await.unwrap(), "0.9.0");
        assert!(backend.start_time().is_some());

        // alive process, control surface gone
        server.reset().await;
        let report = backend.running_status().await;
        assert_eq!(report.status, RunningStatus::BackendError);
        assert!(report.error.is_some());

        backend.stop(&TaskMeta::root("test")).await.unwrap();
        assert_eq!(backend.running_status().await.status, RunningStatus::Offline);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_during_grace() {
        let backend = ProcessBackend::new(plain_spec());
        let raw = serde_yaml::to_value(serde_json::json!({
            "exec": "sleep",
            "args": ["30"],
            "port": unused_port(),
            "startup_grace_ms": 10_000,
        }))
        .unwrap();
        backend.configure(repo(), &raw, &BackendCommons::default()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = backend.start(&TaskMeta::root("test"), cancel).await.unwrap_err();
        assert!(matches!(err, BackendError::Cancelled));
        assert!(backend.pid().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_policy_calls() {
        let server = status_server().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/policies"))
            .and(body_string_contains("renamed"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/policies/original"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let backend = ProcessBackend::new(plain_spec());
        backend
            .configure(
                repo(),
                &fast_config("sleep", &["30"], server.address().port()),
                &BackendCommons::default(),
            )
            .await
            .unwrap();
        backend
            .start(&TaskMeta::root("test"), CancellationToken::new())
            .await
            .unwrap();

        let mut data = PolicyData::new(PolicyId::new(), "renamed", "test", 2, serde_json::json!({}));
        data.transition = PolicyTransition::Renamed {
            from: "original".to_string(),
        };
        backend.apply_policy(&data, true).await.unwrap();

        backend.stop(&TaskMeta::root("test")).await.unwrap();
        server.verify().await;
    }

    #[tokio::test]
    async fn test_policy_calls_skipped_when_not_running() {
        let backend = ProcessBackend::new(plain_spec());
        backend
            .configure(repo(), &serde_yaml::Value::Null, &BackendCommons::default())
            .await
            .unwrap();
        let data = PolicyData::new(PolicyId::new(), "p1", "test", 1, serde_json::json!({}));

        let err = backend.remove_policy(&data).await.unwrap_err();
        assert!(matches!(
            err,
            BackendError::NotRunning {
                status: RunningStatus::Unknown,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_metrics_topic_template() {
        let backend = ProcessBackend::new(plain_spec());
        let agent = AgentId::new();
        let transport: Arc<dyn Transport> = Arc::new(crate::comms::LoopbackTransport::connected());
        backend.set_comms_client(agent, transport, "channels/c1/messages/?/test");

        let topic = backend.metrics_topic.lock().unwrap().clone().unwrap();
        assert!(topic.starts_with("channels/c1/messages/otlp/test/m/"));
    }
}
