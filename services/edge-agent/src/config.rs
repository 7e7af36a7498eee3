//! Configuration for the edge agent.
//!
//! Configuration comes from one or more YAML files, deep-merged in the order
//! given, then from `EDGE_*` environment variables. Every file that states a
//! `version` must agree with the first one that did.
//!
//! ```yaml
//! version: "1.0"
//! agent:
//!   backends:
//!     common:
//!       otel: { host: localhost, port: 4317 }
//!     pktvisor:
//!       port: 10853
//!   policies:
//!     pktvisor:
//!       default_view: { kind: collection }
//!   tags: { region: eu }
//!   config_manager: { active: local }
//!   heartbeat: { interval_secs: 50, restart_cooldown_secs: 300 }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use edge_id::AgentId;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;

use crate::backend::{BackendCommons, RawBackendConfig};

/// Loaded when no config file is given and it exists.
pub const DEFAULT_CONFIG_PATH: &str = "/opt/edge/agent_default.yaml";

/// Reserved key under `agent.backends` holding settings shared by all
/// backends.
pub const COMMON_BACKEND_KEY: &str = "common";

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 50;
pub const DEFAULT_RESTART_COOLDOWN_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to parse config version in: {0}")]
    MissingVersion(PathBuf),

    #[error("config file version mismatch in {path}: expected {expected}, found {found}")]
    VersionMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Agent configuration after merging.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(deserialize_with = "version_string")]
    pub version: Option<String>,
    pub agent: AgentConfig,
    /// Log filter directive; only settable from the environment.
    #[serde(skip)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_id: Option<AgentId>,
    /// Backend name to backend-specific settings, in declaration order.
    pub backends: serde_yaml::Mapping,
    /// Backend name to policy name to policy payload.
    pub policies: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    pub tags: BTreeMap<String, String>,
    pub config_manager: ConfigManagerSettings,
    pub heartbeat: HeartbeatSettings,
    pub debug: DebugSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigManagerSettings {
    /// Which config manager to use. Only `local` is built in.
    pub active: String,
    /// Messaging channel; defaults to one derived from the agent ID.
    pub channel_id: Option<String>,
}

impl Default for ConfigManagerSettings {
    fn default() -> Self {
        Self {
            active: "local".to_string(),
            channel_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_secs: u64,
    pub restart_cooldown_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            restart_cooldown_secs: DEFAULT_RESTART_COOLDOWN_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    pub enable: bool,
}

fn version_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(scalar_string(&serde_yaml::Value::deserialize(d)?))
}

fn scalar_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Merges `overlay` into `base`. Mappings merge key by key; anything else
/// is replaced.
pub fn merge_values(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

impl Config {
    /// Loads and merges the given files, then applies environment overrides.
    /// With no files, [`DEFAULT_CONFIG_PATH`] is used when present.
    pub fn load(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        let paths: Vec<&Path> = if paths.is_empty() {
            if default_path.exists() {
                vec![default_path.as_path()]
            } else {
                Vec::new()
            }
        } else {
            paths.iter().map(PathBuf::as_path).collect()
        };

        let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        let mut expected_version: Option<String> = None;

        for path in paths {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let value: serde_yaml::Value =
                serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?;
            check_version(&mut expected_version, path, &value)?;
            debug!(path = %path.display(), "merging config file");
            merge_values(&mut merged, value);
        }

        let mut config: Config =
            serde_yaml::from_value(merged).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.apply_env();
        Ok(config)
    }

    /// Parses a single YAML document without environment overrides.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Applies `EDGE_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(debug) = lookup("EDGE_DEBUG") {
            self.agent.debug.enable = matches!(debug.trim(), "1" | "true" | "yes" | "on");
        }
        if let Some(secs) = lookup("EDGE_HEARTBEAT_INTERVAL").and_then(|s| s.trim().parse().ok()) {
            self.agent.heartbeat.interval_secs = secs;
        }
        if let Some(secs) = lookup("EDGE_RESTART_COOLDOWN").and_then(|s| s.trim().parse().ok()) {
            self.agent.heartbeat.restart_cooldown_secs = secs;
        }
        if let Some(level) = lookup("EDGE_LOG_LEVEL").filter(|l| !l.trim().is_empty()) {
            self.log_level = Some(level);
        }
    }

    pub fn debug(&self) -> bool {
        self.agent.debug.enable
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.agent.heartbeat.interval_secs.max(1))
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.agent.heartbeat.restart_cooldown_secs)
    }

    /// Splits `agent.backends` into the shared `common` block and the
    /// backend entries in declaration order. Agent tags are folded into the
    /// common OpenTelemetry settings.
    pub fn backend_entries(&self) -> Result<(BackendCommons, Vec<(String, RawBackendConfig)>), ConfigError> {
        let mut common = BackendCommons::default();
        let mut entries = Vec::new();

        for (key, value) in &self.agent.backends {
            let name = key
                .as_str()
                .ok_or_else(|| ConfigError::Invalid(format!("backend name must be a string: {key:?}")))?;
            if name == COMMON_BACKEND_KEY {
                if !value.is_null() {
                    common = serde_yaml::from_value(value.clone()).map_err(|e| {
                        ConfigError::Invalid(format!("failed to decode common backend config: {e}"))
                    })?;
                }
                continue;
            }
            entries.push((name.to_string(), value.clone()));
        }

        if !self.agent.tags.is_empty() {
            common.otel.agent_tags = self.agent.tags.clone();
        }
        Ok((common, entries))
    }

    pub fn backend_config(&self, name: &str) -> RawBackendConfig {
        self.agent
            .backends
            .get(name)
            .cloned()
            .unwrap_or(serde_yaml::Value::Null)
    }
}

fn check_version(
    expected: &mut Option<String>,
    path: &Path,
    value: &serde_yaml::Value,
) -> Result<(), ConfigError> {
    let found = value.get("version").and_then(scalar_string);
    match (expected.as_ref(), found) {
        (None, found) => *expected = found,
        (Some(_), None) => return Err(ConfigError::MissingVersion(path.to_path_buf())),
        (Some(expected), Some(found)) if *expected != found => {
            return Err(ConfigError::VersionMismatch {
                path: path.to_path_buf(),
                expected: expected.clone(),
                found,
            })
        }
        _ => {}
    }
    Ok(())
}
