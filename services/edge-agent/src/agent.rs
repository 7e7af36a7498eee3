//! Agent orchestrator.
//!
//! Owns the started backends and their recorded state, drives startup and
//! shutdown, serializes restarts per backend, and dispatches commands
//! arriving from the control plane.
//!
//! Cancellation hierarchy (all [`CancellationToken`]s):
//!
//! ```text
//! root
//! ├── startup scope ── per-backend scopes
//! └── async scope
//!     ├── heartbeat scope
//!     ├── RPC listener ── per-command scopes
//!     └── request retry timers
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edge_id::{AgentId, DatasetId, GroupId, PolicyId};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::backend::{Backend, BackendCommons, BackendError, BackendRegistry, BackendState, RunningStatus};
use crate::comms::{CommsLogHooks, Qos, Topics, Transport};
use crate::config::{Config, ConfigError};
use crate::config_manager::{self, ConfigManager};
use crate::policy::{LocalPolicyManager, PolicyAction, PolicyCommand, PolicyData, PolicyManager};
use crate::rpc::{AgentCommand, AgentRequest, BackendCapabilities, Capabilities, GroupMembership, RequestFunc};
use crate::task::TaskMeta;

/// Upper bound on waiting for the heartbeat task's final offline send.
const HEARTBEAT_STOP_WAIT: Duration = Duration::from_secs(5);

/// Interval between unanswered group/policy requests.
pub const REQUEST_RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("specified backend does not exist: {0}")]
    UnknownBackend(String),

    #[error("backend {backend} failed to start: {source}")]
    BackendStart {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error("backend {backend} failed to restart: {source}")]
    Restart {
        backend: String,
        #[source]
        source: BackendError,
    },
}

impl From<ConfigError> for AgentError {
    fn from(e: ConfigError) -> Self {
        AgentError::Configuration(e.to_string())
    }
}

/// A remote group the agent belongs to. Reported in heartbeats only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub channel_id: String,
}

#[derive(Default)]
struct Scopes {
    root: Option<CancellationToken>,
    startup: Option<CancellationToken>,
    async_scope: Option<CancellationToken>,
    heartbeat: Option<(CancellationToken, JoinHandle<()>)>,
    group_retry: Option<CancellationToken>,
    policy_retry: Option<CancellationToken>,
}

pub struct Agent {
    pub(crate) agent_id: AgentId,
    config: Config,
    registry: Arc<BackendRegistry>,
    pub(crate) policy_manager: Arc<dyn PolicyManager>,
    pub(crate) config_manager: Box<dyn ConfigManager>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) topics: Topics,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) restart_cooldown: Duration,
    common: RwLock<BackendCommons>,
    backends: RwLock<Vec<(String, Arc<dyn Backend>)>>,
    pub(crate) backend_states: RwLock<HashMap<String, BackendState>>,
    restart_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    groups: RwLock<BTreeMap<GroupId, GroupInfo>>,
    scopes: Mutex<Scopes>,
    stopped: AtomicBool,
}

impl Agent {
    pub fn new(
        config: Config,
        registry: Arc<BackendRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, AgentError> {
        let policy_manager = Arc::new(LocalPolicyManager::new(registry.clone()));
        Self::with_policy_manager(config, registry, transport, policy_manager)
    }

    pub fn with_policy_manager(
        config: Config,
        registry: Arc<BackendRegistry>,
        transport: Arc<dyn Transport>,
        policy_manager: Arc<dyn PolicyManager>,
    ) -> Result<Arc<Self>, AgentError> {
        let agent_id = config.agent.agent_id.unwrap_or_default();
        let config_manager = config_manager::from_settings(agent_id, &config.agent.config_manager);
        let credentials = config_manager.transport_credentials()?;

        Ok(Arc::new(Self {
            agent_id,
            topics: Topics::for_channel(&credentials.channel_id),
            heartbeat_interval: config.heartbeat_interval(),
            restart_cooldown: config.restart_cooldown(),
            config,
            registry,
            policy_manager,
            config_manager,
            transport,
            common: RwLock::new(BackendCommons::default()),
            backends: RwLock::new(Vec::new()),
            backend_states: RwLock::new(HashMap::new()),
            restart_locks: Mutex::new(HashMap::new()),
            groups: RwLock::new(BTreeMap::new()),
            scopes: Mutex::new(Scopes::default()),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn policy_manager(&self) -> Arc<dyn PolicyManager> {
        self.policy_manager.clone()
    }

    fn task(&self, routine: &str) -> TaskMeta {
        self.config_manager.task_context(&TaskMeta::root(routine))
    }

    fn with_scopes<R>(&self, f: impl FnOnce(&mut Scopes) -> R) -> Option<R> {
        self.scopes.lock().ok().map(|mut scopes| f(&mut scopes))
    }

    fn async_scope(&self) -> CancellationToken {
        self.with_scopes(|s| s.async_scope.clone())
            .flatten()
            .unwrap_or_default()
    }

    fn backend_scope(&self) -> CancellationToken {
        self.with_scopes(|s| s.startup.as_ref().map(CancellationToken::child_token))
            .flatten()
            .unwrap_or_default()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts backends, applies local policies, starts the heartbeat and,
    /// when the transport is connected, the RPC listener and request timers.
    pub async fn start(self: &Arc<Self>, root: CancellationToken) -> Result<(), AgentError> {
        let started = std::time::Instant::now();
        let startup = root.child_token();
        let async_scope = root.child_token();
        self.with_scopes(|s| {
            s.root = Some(root.clone());
            s.startup = Some(startup.clone());
            s.async_scope = Some(async_scope.clone());
        });

        let task = self.task("agent");
        info!(
            version = env!("CARGO_PKG_VERSION"),
            agent_id = %self.agent_id,
            routine = %task.routine(),
            "agent started"
        );

        let debug = self.config.debug();
        if debug {
            info!("debug logging enabled");
        }
        self.transport.install_log_hooks(CommsLogHooks::new(debug));

        self.start_backends(&task).await?;
        self.manage_policies().await?;
        self.start_heartbeat().await;

        if self.transport.is_connected() {
            self.connect().await;
        } else {
            debug!("transport not connected, running without control plane");
        }

        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "agent startup complete");
        Ok(())
    }

    /// Configures and starts every declared backend, in declaration order.
    /// The first failure aborts; already started backends keep running.
    pub async fn start_backends(&self, task: &TaskMeta) -> Result<(), AgentError> {
        let (common, entries) = self.config.backend_entries()?;
        info!(registered = ?self.registry.names(), "registered backends");
        if entries.is_empty() {
            return Err(AgentError::Configuration("no backends specified".to_string()));
        }
        *self.common.write().await = common.clone();

        let repo = self.policy_manager.repo();
        for (name, raw) in entries {
            let backend = self
                .registry
                .get(&name)
                .ok_or_else(|| AgentError::UnknownBackend(name.clone()))?;

            if let Err(source) = backend.configure(repo.clone(), &raw, &common).await {
                warn!(backend = %name, error = %source, "failed to configure backend");
                return Err(AgentError::BackendStart { backend: name, source });
            }

            let initial = backend.initial_state();
            self.backend_states
                .write()
                .await
                .insert(name.clone(), BackendState::seeded(initial));
            self.backends.write().await.push((name.clone(), backend.clone()));
            backend.set_comms_client(
                self.agent_id,
                self.transport.clone(),
                &self.topics.backend_template(&name),
            );

            let backend_task = self.config_manager.task_context(&task.with_routine(&name));
            if let Err(source) = backend.start(&backend_task, self.backend_scope()).await {
                warn!(backend = %name, error = %source, "failed to start backend");
                if initial == RunningStatus::BackendError {
                    if let Some(state) = self.backend_states.write().await.get_mut(&name) {
                        state.last_error = Some(source.to_string());
                    }
                }
                return Err(AgentError::BackendStart { backend: name, source });
            }
            info!(backend = %name, "backend started");
        }
        Ok(())
    }

    /// Hands every locally declared policy to the policy manager with a
    /// fresh dataset.
    pub async fn manage_policies(&self) -> Result<(), AgentError> {
        let policies = &self.config.agent.policies;
        if policies.is_empty() {
            return Err(AgentError::Configuration("no policies specified".to_string()));
        }

        for backend in policies.keys() {
            if self.started_backend(backend).await.is_none() {
                return Err(AgentError::UnknownBackend(backend.clone()));
            }
        }
        for backend in policies.keys() {
            self.manage_local_policies(backend).await;
        }
        Ok(())
    }

    async fn manage_local_policies(&self, backend: &str) {
        let Some(policies) = self.config.agent.policies.get(backend) else {
            return;
        };
        for (name, data) in policies {
            let command = PolicyCommand::manage(name, backend, data.clone()).with_dataset(DatasetId::new());
            self.policy_manager.manage_policy(command).await;
        }
    }

    /// Recycles one backend. Serialized per backend name.
    pub async fn restart_backend(&self, name: &str, reason: &str) -> Result<(), AgentError> {
        if self.started_backend(name).await.is_none() {
            return Err(AgentError::UnknownBackend(name.to_string()));
        }
        let lock = self.restart_lock(name);
        let _guard = lock.lock().await;
        self.restart_locked(name, reason).await
    }

    /// Spawns a restart unless one is already in flight for this backend.
    pub(crate) fn spawn_restart(self: &Arc<Self>, name: &str, reason: &str) -> Option<JoinHandle<()>> {
        let lock = self.restart_lock(name);
        let Ok(guard) = lock.try_lock_owned() else {
            debug!(backend = %name, "restart already in flight, skipping");
            return None;
        };

        let agent = Arc::clone(self);
        let name = name.to_string();
        let reason = reason.to_string();
        Some(tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = agent.restart_locked(&name, &reason).await {
                error!(backend = %name, error = %e, "failed to restart backend");
            }
        }))
    }

    fn restart_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.restart_locks.lock() {
            Ok(mut locks) => locks.entry(name.to_string()).or_default().clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    async fn restart_locked(&self, name: &str, reason: &str) -> Result<(), AgentError> {
        let backend = self
            .started_backend(name)
            .await
            .ok_or_else(|| AgentError::UnknownBackend(name.to_string()))?;
        let task = self.task(&format!("restart.{name}"));

        info!(backend = %name, reason = %reason, "restarting backend");
        {
            let mut states = self.backend_states.write().await;
            let state = states.entry(name.to_string()).or_default();
            state.restart_count += 1;
            state.last_restart_ts = Some(chrono::Utc::now());
            state.last_restart_reason = Some(reason.to_string());
        }

        info!(backend = %name, "removing policies");
        if let Err(e) = self.policy_manager.remove_backend_policies(name, true).await {
            error!(backend = %name, error = %e, "failed to remove policies");
        }

        let common = self.common.read().await.clone();
        backend
            .configure(self.policy_manager.repo(), &self.config.backend_config(name), &common)
            .await
            .map_err(|source| AgentError::Restart {
                backend: name.to_string(),
                source,
            })?;

        info!(backend = %name, "resetting backend");
        let reset = backend.full_reset(&task, self.backend_scope()).await;
        backend.set_comms_client(
            self.agent_id,
            self.transport.clone(),
            &self.topics.backend_template(name),
        );

        match reset {
            Ok(()) => {
                self.manage_local_policies(name).await;
                if self.transport.is_connected() {
                    self.send_request(RequestFunc::AgentPoliciesReq, serde_json::json!({}))
                        .await;
                }
            }
            Err(e) => {
                error!(backend = %name, error = %e, "failed to reset backend");
                if let Some(state) = self.backend_states.write().await.get_mut(name) {
                    state.last_error = Some(format!("failed to reset backend: {e}"));
                }
            }
        }
        Ok(())
    }

    /// Stops the heartbeat and restarts every backend in turn. Restarting
    /// the heartbeat is left to the caller.
    pub async fn restart_all(&self, reason: &str) -> Result<(), AgentError> {
        self.stop_heartbeat().await;
        info!(reason = %reason, "restarting all backends");
        for (name, _) in self.started_backends().await {
            if let Err(e) = self.restart_backend(&name, reason).await {
                error!(backend = %name, error = %e, "failed to restart backend");
            }
        }
        info!("all backends were restarted");
        Ok(())
    }

    /// Graceful, idempotent shutdown.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("agent already stopped");
            return;
        }
        info!(routine = "stop", "routine call for stop agent");

        if let Some(scope) = self.with_scopes(|s| s.async_scope.clone()).flatten() {
            scope.cancel();
        }
        self.stop_heartbeat().await;

        let task = self.task("stop");
        for (name, backend) in self.started_backends().await {
            if backend.running_status().await.status == RunningStatus::Running {
                debug!(backend = %name, "stopping backend");
                if let Err(e) = backend.stop(&task).await {
                    error!(backend = %name, error = %e, "error while stopping the backend");
                }
            }
        }

        if self.transport.is_connected() {
            if let Err(e) = self.transport.unsubscribe(&self.topics.rpc_from_core).await {
                warn!(error = %e, "failed to unsubscribe from RPC channel");
            }
            self.transport.disconnect().await;
        }

        let root = self.with_scopes(|s| {
            if let Some(t) = s.policy_retry.take() {
                t.cancel();
            }
            if let Some(t) = s.group_retry.take() {
                t.cancel();
            }
            s.root.clone()
        });
        if let Some(root) = root.flatten() {
            root.cancel();
        }
        info!("agent stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Heartbeat control
    // =========================================================================

    /// Starts the heartbeat routine. A routine already running is stopped
    /// first, so its offline heartbeat lands before the new routine's first
    /// online one.
    pub async fn start_heartbeat(self: &Arc<Self>) {
        self.stop_heartbeat().await;
        let scope = self.async_scope().child_token();
        let handle = tokio::spawn(Arc::clone(self).run_heartbeat_loop(scope.clone()));
        self.with_scopes(|s| s.heartbeat = Some((scope, handle)));
        info!("heartbeat routine started");
    }

    /// Cancels the heartbeat scope and waits, bounded, for the final
    /// offline heartbeat.
    pub async fn stop_heartbeat(&self) {
        let Some((scope, handle)) = self.with_scopes(|s| s.heartbeat.take()).flatten() else {
            return;
        };
        scope.cancel();
        match tokio::time::timeout(HEARTBEAT_STOP_WAIT, handle).await {
            Ok(Ok(())) => debug!("heartbeat routine stopped"),
            Ok(Err(e)) => warn!(error = %e, "heartbeat routine ended abnormally"),
            Err(_) => warn!("timed out waiting for final heartbeat"),
        }
    }

    // =========================================================================
    // State access
    // =========================================================================

    pub async fn started_backends(&self) -> Vec<(String, Arc<dyn Backend>)> {
        self.backends.read().await.clone()
    }

    pub async fn started_backend(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends
            .read()
            .await
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b.clone())
    }

    pub async fn backend_state(&self, name: &str) -> Option<BackendState> {
        self.backend_states.read().await.get(name).cloned()
    }

    pub async fn groups(&self) -> BTreeMap<GroupId, GroupInfo> {
        self.groups.read().await.clone()
    }

    pub(crate) async fn group_snapshot(&self) -> BTreeMap<String, GroupInfo> {
        self.groups
            .read()
            .await
            .iter()
            .map(|(id, g)| (id.to_string(), g.clone()))
            .collect()
    }

    // =========================================================================
    // Control plane
    // =========================================================================

    /// Subscribes to RPC, sends capabilities and starts the group and
    /// policy request timers. Failures are logged.
    async fn connect(self: &Arc<Self>) {
        match self.transport.subscribe(&self.topics.rpc_from_core).await {
            Ok(commands) => {
                let scope = self.async_scope();
                tokio::spawn(Arc::clone(self).listen(commands, scope));
                info!(topic = %self.topics.rpc_from_core, "subscribed to RPC channel");
            }
            Err(e) => error!(error = %e, "failed to subscribe to RPC channel"),
        }

        self.send_capabilities().await;

        let group_retry = self.spawn_request_timer(RequestFunc::GroupMembershipReq);
        let policy_retry = self.spawn_request_timer(RequestFunc::AgentPoliciesReq);
        self.with_scopes(|s| {
            s.group_retry = Some(group_retry);
            s.policy_retry = Some(policy_retry);
        });
    }

    async fn listen(self: Arc<Self>, mut commands: mpsc::Receiver<AgentCommand>, scope: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.dispatch(command);
        }
        debug!("RPC listener stopped");
    }

    /// Runs a command in its own task under a child of the async scope.
    pub fn dispatch(self: &Arc<Self>, command: AgentCommand) -> JoinHandle<()> {
        let scope = self.async_scope().child_token();
        let task = self.task("rpc").traced(command.routine());
        let span = task.span();
        let agent = Arc::clone(self);

        tokio::spawn(
            async move {
                debug!("handling command");
                tokio::select! {
                    _ = scope.cancelled() => debug!("command scope cancelled"),
                    _ = agent.handle_command(command) => {}
                }
            }
            .instrument(span),
        )
    }

    async fn handle_command(self: &Arc<Self>, command: AgentCommand) {
        match command {
            AgentCommand::GroupMembership { full_list, groups } => {
                self.apply_group_membership(full_list, groups).await;
            }
            AgentCommand::GroupRemoved { group_id } => {
                if self.groups.write().await.remove(&group_id).is_some() {
                    info!(group_id = %group_id, "group removed");
                }
            }
            AgentCommand::AgentPolicies { full_list, policies } => {
                self.apply_agent_policies(full_list, policies).await;
            }
            AgentCommand::DatasetRemoved { dataset_id, policy_id } => {
                if let Err(e) = self
                    .policy_manager
                    .remove_policy_dataset(&policy_id, &dataset_id)
                    .await
                {
                    warn!(policy_id = %policy_id, dataset_id = %dataset_id, error = %e, "dataset removal failed");
                }
            }
            AgentCommand::AgentStop { reason } => {
                info!(reason = %reason, "stop requested by control plane");
                // stop cancels this command's scope; run it outside
                let agent = Arc::clone(self);
                tokio::spawn(async move { agent.stop().await });
            }
            AgentCommand::AgentReset { full_reset, reason } => {
                info!(full_reset, reason = %reason, "reset requested by control plane");
                if full_reset {
                    if let Err(e) = self.restart_all(&reason).await {
                        error!(error = %e, "full reset failed");
                    }
                }
                self.start_heartbeat().await;
            }
        }
    }

    async fn apply_group_membership(&self, full_list: bool, groups: Vec<GroupMembership>) {
        if let Some(retry) = self.with_scopes(|s| s.group_retry.take()).flatten() {
            retry.cancel();
        }
        let mut known = self.groups.write().await;
        if full_list {
            known.clear();
        }
        for group in groups {
            debug!(group_id = %group.group_id, name = %group.name, "group membership");
            known.insert(
                group.group_id,
                GroupInfo {
                    name: group.name,
                    channel_id: group.channel_id,
                },
            );
        }
    }

    async fn apply_agent_policies(&self, full_list: bool, policies: Vec<PolicyCommand>) {
        if let Some(retry) = self.with_scopes(|s| s.policy_retry.take()).flatten() {
            retry.cancel();
        }

        if full_list {
            let keep: Vec<PolicyId> = policies.iter().filter_map(|p| p.id.clone()).collect();
            let stale: Vec<PolicyData> = match self.policy_manager.policy_state().await {
                Ok(current) => current
                    .into_iter()
                    .filter(|p| !keep.contains(&p.id))
                    .collect(),
                Err(e) => {
                    error!(error = %e, "unable to retrieve policy state");
                    Vec::new()
                }
            };
            for policy in stale {
                info!(policy_id = %policy.id, "policy not in full list, removing");
                let mut command = PolicyCommand::manage(policy.name, policy.backend, serde_json::Value::Null)
                    .with_id(policy.id);
                command.action = PolicyAction::Remove;
                self.policy_manager.manage_policy(command).await;
            }
        }

        for command in policies {
            self.policy_manager.manage_policy(command).await;
        }
    }

    async fn send_capabilities(&self) {
        let mut capabilities = Capabilities {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            tags: self.config.agent.tags.clone(),
            ..Default::default()
        };
        for (name, backend) in self.started_backends().await {
            let version = backend.version().await.unwrap_or_else(|e| {
                warn!(backend = %name, error = %e, "failed to retrieve backend version");
                String::new()
            });
            let data = backend.capabilities().await.unwrap_or_else(|e| {
                warn!(backend = %name, error = %e, "failed to retrieve backend capabilities");
                serde_json::Map::new()
            });
            capabilities
                .backends
                .insert(name, BackendCapabilities { version, data });
        }

        match serde_json::to_value(&capabilities) {
            Ok(payload) => {
                self.publish_request(&self.topics.capabilities, RequestFunc::AgentCapabilities, payload)
                    .await;
            }
            Err(e) => error!(error = %e, "error marshalling capabilities"),
        }
    }

    async fn send_request(&self, func: RequestFunc, payload: serde_json::Value) {
        self.publish_request(&self.topics.rpc_to_core, func, payload).await;
    }

    async fn publish_request(&self, topic: &str, func: RequestFunc, payload: serde_json::Value) {
        let request = AgentRequest::new(func, payload);
        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "error marshalling request");
                return;
            }
        };
        if let Err(e) = self.transport.publish(topic, Qos::AtLeastOnce, body).await {
            error!(topic = %topic, func = ?func, error = %e, "failed to send request");
        }
    }

    /// Sends `func` now and then every [`REQUEST_RETRY_INTERVAL`] until the
    /// returned scope is cancelled.
    fn spawn_request_timer(self: &Arc<Self>, func: RequestFunc) -> CancellationToken {
        let scope = self.async_scope().child_token();
        let cancel = scope.clone();
        let agent = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REQUEST_RETRY_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!(func = ?func, "sending request");
                        agent.send_request(func, serde_json::json!({})).await;
                    }
                }
            }
        });
        scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::comms::LoopbackTransport;

    const CONFIG: &str = r#"
agent:
  backends:
    mock: {}
  policies:
    mock:
      p1:
        kind: collection
"#;

    fn agent_with(config: &str, mock: Arc<MockBackend>, transport: Arc<LoopbackTransport>) -> Arc<Agent> {
        let mut registry = BackendRegistry::new();
        registry.register("mock", mock);
        let config = Config::from_yaml_str(config).unwrap();
        Agent::new(config, Arc::new(registry), transport).unwrap()
    }

    #[tokio::test]
    async fn test_no_backends_is_configuration_error() {
        let agent = agent_with(
            "agent: {}",
            Arc::new(MockBackend::running()),
            Arc::new(LoopbackTransport::disconnected()),
        );
        let err = agent.start_backends(&TaskMeta::root("test")).await.unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let agent = agent_with(
            "agent:\n  backends:\n    nope: {}\n",
            Arc::new(MockBackend::running()),
            Arc::new(LoopbackTransport::disconnected()),
        );
        let err = agent.start_backends(&TaskMeta::root("test")).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownBackend(ref n) if n == "nope"));
    }

    #[tokio::test]
    async fn test_start_failure_aborts() {
        let mock = Arc::new(MockBackend::running());
        mock.fail_start(true);
        let agent = agent_with(CONFIG, mock.clone(), Arc::new(LoopbackTransport::disconnected()));

        let err = agent.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::BackendStart { .. }));
        assert_eq!(mock.calls().configure, 1);
    }

    #[tokio::test]
    async fn test_policies_need_started_backend() {
        let config = "agent:\n  backends:\n    mock: {}\n  policies:\n    other:\n      p1: {}\n";
        let agent = agent_with(
            config,
            Arc::new(MockBackend::running()),
            Arc::new(LoopbackTransport::disconnected()),
        );
        agent.start_backends(&TaskMeta::root("test")).await.unwrap();

        let err = agent.manage_policies().await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownBackend(ref n) if n == "other"));
    }

    #[tokio::test]
    async fn test_restart_unknown_backend() {
        let agent = agent_with(
            CONFIG,
            Arc::new(MockBackend::running()),
            Arc::new(LoopbackTransport::disconnected()),
        );
        let err = agent.restart_backend("mock", "test").await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownBackend(_)));
    }

    #[tokio::test]
    async fn test_restart_records_state_and_reapplies_policies() {
        let mock = Arc::new(MockBackend::running());
        let agent = agent_with(CONFIG, mock.clone(), Arc::new(LoopbackTransport::disconnected()));
        agent.start_backends(&TaskMeta::root("test")).await.unwrap();
        agent.manage_policies().await.unwrap();
        let before = agent.policy_manager().policy_state().await.unwrap();

        agent.restart_backend("mock", "manual").await.unwrap();

        let state = agent.backend_state("mock").await.unwrap();
        assert_eq!(state.restart_count, 1);
        assert_eq!(state.last_restart_reason.as_deref(), Some("manual"));
        assert_eq!(mock.calls().full_reset, 1);
        assert_eq!(mock.calls().configure, 2);

        let after = agent.policy_manager().policy_state().await.unwrap();
        assert_eq!(after.len(), 1);
        assert_ne!(before[0].id, after[0].id);
    }

    #[tokio::test]
    async fn test_reset_failure_recorded() {
        let mock = Arc::new(MockBackend::running());
        mock.fail_reset(true);
        let agent = agent_with(CONFIG, mock.clone(), Arc::new(LoopbackTransport::disconnected()));
        agent.start_backends(&TaskMeta::root("test")).await.unwrap();

        agent.restart_backend("mock", "manual").await.unwrap();

        let state = agent.backend_state("mock").await.unwrap();
        assert!(state.last_error.unwrap().starts_with("failed to reset backend"));
        assert_eq!(state.restart_count, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_restart_orders_offline_before_online() {
        let mock = Arc::new(MockBackend::running());
        let transport = Arc::new(LoopbackTransport::connected());
        let agent = agent_with(CONFIG, mock, transport.clone());
        agent.start_backends(&TaskMeta::root("test")).await.unwrap();

        agent.start_heartbeat().await;
        agent.start_heartbeat().await;
        agent.stop_heartbeat().await;

        let states: Vec<serde_json::Value> = transport
            .published_on(&agent.topics().heartbeat)
            .iter()
            .map(|p| serde_json::from_slice::<serde_json::Value>(p).unwrap()["state"].clone())
            .collect();
        assert_eq!(states, vec!["online", "offline", "online", "offline"]);
        assert!(agent.with_scopes(|s| s.heartbeat.is_none()).unwrap());
    }

    #[tokio::test]
    async fn test_spawn_restart_skips_when_in_flight() {
        let mock = Arc::new(MockBackend::running());
        mock.set_reset_delay(Duration::from_millis(200));
        let agent = agent_with(CONFIG, mock.clone(), Arc::new(LoopbackTransport::disconnected()));
        agent.start_backends(&TaskMeta::root("test")).await.unwrap();

        let first = agent.spawn_restart("mock", "health").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(agent.spawn_restart("mock", "health").is_none());

        first.await.unwrap();
        assert_eq!(agent.backend_state("mock").await.unwrap().restart_count, 1);
        assert!(agent.spawn_restart("mock", "health").is_some());
    }

    #[tokio::test]
    async fn test_group_membership_commands() {
        let agent = agent_with(
            CONFIG,
            Arc::new(MockBackend::running()),
            Arc::new(LoopbackTransport::disconnected()),
        );
        let g1 = GroupId::new();
        let g2 = GroupId::new();
        let membership = |id: GroupId, name: &str| GroupMembership {
            group_id: id,
            name: name.to_string(),
            channel_id: format!("{name}-channel"),
        };

        agent
            .dispatch(AgentCommand::GroupMembership {
                full_list: false,
                groups: vec![membership(g1.clone(), "a"), membership(g2, "b")],
            })
            .await
            .unwrap();
        assert_eq!(agent.groups().await.len(), 2);

        agent
            .dispatch(AgentCommand::GroupRemoved { group_id: g1.clone() })
            .await
            .unwrap();
        assert_eq!(agent.groups().await.len(), 1);

        agent
            .dispatch(AgentCommand::GroupMembership {
                full_list: true,
                groups: vec![membership(g1.clone(), "a")],
            })
            .await
            .unwrap();
        let groups = agent.groups().await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&g1].channel_id, "a-channel");
    }

    #[tokio::test]
    async fn test_full_policy_list_removes_unlisted() {
        let mock = Arc::new(MockBackend::running());
        let agent = agent_with(CONFIG, mock.clone(), Arc::new(LoopbackTransport::disconnected()));
        agent.start_backends(&TaskMeta::root("test")).await.unwrap();
        agent.manage_policies().await.unwrap();

        let remote = PolicyCommand::manage("remote", "mock", serde_json::json!({}))
            .with_id(PolicyId::new())
            .with_dataset(DatasetId::new());
        agent
            .dispatch(AgentCommand::AgentPolicies {
                full_list: true,
                policies: vec![remote.clone()],
            })
            .await
            .unwrap();

        let state = agent.policy_manager().policy_state().await.unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(Some(&state[0].id), remote.id.as_ref());
        assert_eq!(mock.removed(), vec!["p1".to_string()]);
    }
}
