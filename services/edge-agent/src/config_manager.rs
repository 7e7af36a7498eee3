//! Config managers decide how the agent learns its messaging credentials and
//! which identity it stamps onto its tasks.

use edge_id::AgentId;
use tracing::warn;

use crate::config::{ConfigError, ConfigManagerSettings};
use crate::task::TaskMeta;

/// Where and whether to connect to the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportCredentials {
    pub connect: bool,
    pub address: Option<String>,
    pub client_id: Option<String>,
    pub key: Option<String>,
    pub channel_id: String,
}

pub trait ConfigManager: Send + Sync {
    fn name(&self) -> &'static str;

    fn transport_credentials(&self) -> Result<TransportCredentials, ConfigError>;

    /// Stamps the agent identity onto task metadata.
    fn task_context(&self, meta: &TaskMeta) -> TaskMeta;
}

/// Runs from local configuration only; never connects anywhere.
#[derive(Debug, Clone)]
pub struct LocalConfigManager {
    agent_id: AgentId,
    channel_id: String,
}

impl LocalConfigManager {
    pub fn new(agent_id: AgentId, settings: &ConfigManagerSettings) -> Self {
        let channel_id = settings
            .channel_id
            .clone()
            .unwrap_or_else(|| agent_id.ulid().to_string().to_lowercase());
        Self {
            agent_id,
            channel_id,
        }
    }
}

impl ConfigManager for LocalConfigManager {
    fn name(&self) -> &'static str {
        "local"
    }

    fn transport_credentials(&self) -> Result<TransportCredentials, ConfigError> {
        Ok(TransportCredentials {
            connect: false,
            channel_id: self.channel_id.clone(),
            ..Default::default()
        })
    }

    fn task_context(&self, meta: &TaskMeta) -> TaskMeta {
        meta.with_agent(self.agent_id)
    }
}

/// Resolves the configured manager. Unknown selections fall back to local.
pub fn from_settings(agent_id: AgentId, settings: &ConfigManagerSettings) -> Box<dyn ConfigManager> {
    match settings.active.as_str() {
        "local" => {}
        other => warn!(config_manager = %other, "unknown config manager, falling back to local"),
    }
    Box::new(LocalConfigManager::new(agent_id, settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("local")]
    #[case("cloud")]
    #[case("")]
    fn test_selection_falls_back_to_local(#[case] active: &str) {
        let settings = ConfigManagerSettings {
            active: active.to_string(),
            channel_id: None,
        };
        let manager = from_settings(AgentId::new(), &settings);
        assert_eq!(manager.name(), "local");
        assert!(!manager.transport_credentials().unwrap().connect);
    }

    #[test]
    fn test_channel_from_settings() {
        let settings = ConfigManagerSettings {
            active: "local".to_string(),
            channel_id: Some("c1".to_string()),
        };
        let manager = LocalConfigManager::new(AgentId::new(), &settings);
        assert_eq!(manager.transport_credentials().unwrap().channel_id, "c1");
    }

    #[test]
    fn test_task_context_stamps_identity() {
        let agent_id = AgentId::new();
        let manager = LocalConfigManager::new(agent_id, &ConfigManagerSettings::default());
        let meta = manager.task_context(&TaskMeta::root("heartbeat"));

        assert_eq!(meta.agent_id(), Some(agent_id));
        assert_eq!(meta.routine(), "heartbeat");
    }
}
