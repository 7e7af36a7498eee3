//! Applies policy commands to backends and keeps the repository in step.

use std::sync::Arc;

use async_trait::async_trait;
use edge_id::{DatasetId, GroupId, PolicyId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    MemPolicyRepo, PolicyData, PolicyError, PolicyState, PolicyTransition, SharedPolicyRepo,
};
use crate::backend::BackendRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Manage,
    Remove,
}

/// One policy instruction, from the control plane or the local config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCommand {
    pub action: PolicyAction,
    #[serde(default)]
    pub id: Option<PolicyId>,
    pub name: String,
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub backend: String,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl PolicyCommand {
    pub fn manage(name: impl Into<String>, backend: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            action: PolicyAction::Manage,
            id: None,
            name: name.into(),
            dataset_id: None,
            group_id: None,
            backend: backend.into(),
            version: 1,
            data,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: PolicyId) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn with_dataset(mut self, dataset: DatasetId) -> Self {
        self.dataset_id = Some(dataset);
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }
}

#[async_trait]
pub trait PolicyManager: Send + Sync {
    /// Applies one command. Backend failures are recorded on the policy,
    /// not returned.
    async fn manage_policy(&self, command: PolicyCommand);

    fn repo(&self) -> SharedPolicyRepo;

    /// Drops a backend's policies from the reported set. With `purge_all`
    /// they are removed outright, otherwise their state resets to unknown.
    async fn remove_backend_policies(&self, backend: &str, purge_all: bool) -> Result<(), PolicyError>;

    /// Detaches a dataset. A policy left with no datasets is removed from
    /// its backend and the repository.
    async fn remove_policy_dataset(&self, policy: &PolicyId, dataset: &DatasetId) -> Result<(), PolicyError>;

    async fn policy_state(&self) -> Result<Vec<PolicyData>, PolicyError>;
}

/// Manager applying policies through the backend registry.
pub struct LocalPolicyManager {
    registry: Arc<BackendRegistry>,
    repo: SharedPolicyRepo,
}

impl LocalPolicyManager {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self::with_repo(registry, Arc::new(RwLock::new(MemPolicyRepo::new())))
    }

    pub fn with_repo(registry: Arc<BackendRegistry>, repo: SharedPolicyRepo) -> Self {
        Self { registry, repo }
    }

    async fn resolve_existing(&self, command: &PolicyCommand) -> Option<PolicyData> {
        let repo = self.repo.read().await;
        match &command.id {
            Some(id) => repo.get(id).ok(),
            None => repo.get_by_name(&command.name).ok(),
        }
    }

    async fn attach_memberships(&self, id: &PolicyId, command: &PolicyCommand) -> Result<(), PolicyError> {
        let mut repo = self.repo.write().await;
        if let Some(dataset) = &command.dataset_id {
            repo.ensure_dataset(id, dataset.clone())?;
        }
        if let Some(group) = &command.group_id {
            repo.ensure_group_id(id, group.clone())?;
        }
        Ok(())
    }

    async fn apply(&self, command: PolicyCommand) -> Result<(), PolicyError> {
        let backend = self
            .registry
            .get(&command.backend)
            .ok_or_else(|| PolicyError::UnknownBackend(command.backend.clone()))?;
        let existing = self.resolve_existing(&command).await;
        let id = existing
            .as_ref()
            .map(|p| p.id.clone())
            .or_else(|| command.id.clone())
            .unwrap_or_default();

        {
            let repo = self.repo.read().await;
            if let Ok(holder) = repo.get_by_name(&command.name) {
                if holder.id != id {
                    return Err(PolicyError::NameConflict {
                        name: command.name,
                        holder: holder.id,
                    });
                }
            }
        }

        if let Some(current) = &existing {
            if current.version >= command.version {
                debug!(
                    policy_id = %id,
                    version = command.version,
                    current = current.version,
                    "policy already applied at this version"
                );
                return self.attach_memberships(&id, &command).await;
            }
        }

        let mut data = PolicyData::new(id.clone(), &command.name, &command.backend, command.version, command.data.clone());
        let update = match &existing {
            Some(current) => {
                data.datasets = current.datasets.clone();
                data.group_ids = current.group_ids.clone();
                data.last_scrape_bytes = current.last_scrape_bytes;
                data.last_scrape_ts = current.last_scrape_ts;
                if current.name != command.name {
                    data.transition = PolicyTransition::Renamed {
                        from: current.name.clone(),
                    };
                }
                true
            }
            None => false,
        };

        match backend.apply_policy(&data, update).await {
            Ok(()) => {
                info!(policy_id = %id, policy_name = %data.name, backend = %data.backend, update, "policy applied");
                data.state = PolicyState::Running;
                data.backend_err = None;
            }
            Err(e) => {
                warn!(policy_id = %id, policy_name = %data.name, error = %e, "policy failed to apply");
                data.state = PolicyState::FailedToApply;
                data.backend_err = Some(e.to_string());
            }
        }
        data.transition = PolicyTransition::Applied;

        self.repo.write().await.update(data)?;
        self.attach_memberships(&id, &command).await
    }

    async fn remove(&self, command: PolicyCommand) -> Result<(), PolicyError> {
        let Some(data) = self.resolve_existing(&command).await else {
            debug!(policy_name = %command.name, "remove for unknown policy ignored");
            return Ok(());
        };
        self.remove_from_backend(&data).await;
        self.repo.write().await.remove(&data.id)
    }

    async fn remove_from_backend(&self, data: &PolicyData) {
        let Some(backend) = self.registry.get(&data.backend) else {
            warn!(policy_id = %data.id, backend = %data.backend, "policy backend not registered");
            return;
        };
        if let Err(e) = backend.remove_policy(data).await {
            warn!(policy_id = %data.id, policy_name = %data.name, error = %e, "backend failed to remove policy");
        }
    }
}

#[async_trait]
impl PolicyManager for LocalPolicyManager {
    async fn manage_policy(&self, command: PolicyCommand) {
        let name = command.name.clone();
        let result = match command.action {
            PolicyAction::Manage => self.apply(command).await,
            PolicyAction::Remove => self.remove(command).await,
        };
        if let Err(e) = result {
            warn!(policy_name = %name, error = %e, "policy command rejected");
        }
    }

    fn repo(&self) -> SharedPolicyRepo {
        self.repo.clone()
    }

    async fn remove_backend_policies(&self, backend: &str, purge_all: bool) -> Result<(), PolicyError> {
        let mut repo = self.repo.write().await;
        for mut policy in repo.get_all().into_iter().filter(|p| p.backend == backend) {
            if purge_all {
                repo.remove(&policy.id)?;
            } else {
                policy.state = PolicyState::Unknown;
                policy.backend_err = None;
                repo.update(policy)?;
            }
        }
        Ok(())
    }

    async fn remove_policy_dataset(&self, policy: &PolicyId, dataset: &DatasetId) -> Result<(), PolicyError> {
        let orphan = self.repo.write().await.remove_dataset(policy, dataset)?;
        if !orphan {
            return Ok(());
        }

        let data = self.repo.read().await.get(policy)?;
        info!(policy_id = %policy, "policy has no datasets left, removing");
        self.remove_from_backend(&data).await;
        self.repo.write().await.remove(policy)
    }

    async fn policy_state(&self) -> Result<Vec<PolicyData>, PolicyError> {
        Ok(self.repo.read().await.get_all())
    }
}
