//! Indexed in-memory store of applied policies.

use std::collections::HashMap;

use edge_id::{DatasetId, GroupId, PolicyId};

use super::{PolicyData, PolicyError};

/// Store of applied policies, indexed by ID and by name.
///
/// Implementations do no locking; callers serialize mutation through the
/// lock in [`super::SharedPolicyRepo`].
pub trait PolicyRepository: Send + Sync {
    fn exists(&self, id: &PolicyId) -> bool;

    fn get(&self, id: &PolicyId) -> Result<PolicyData, PolicyError>;

    fn get_by_name(&self, name: &str) -> Result<PolicyData, PolicyError>;

    /// Insert or replace by ID. A rename drops the stale name entry.
    fn update(&mut self, data: PolicyData) -> Result<(), PolicyError>;

    fn remove(&mut self, id: &PolicyId) -> Result<(), PolicyError>;

    /// Independent copy of every stored policy, in no particular order.
    fn get_all(&self) -> Vec<PolicyData>;

    fn ensure_dataset(&mut self, id: &PolicyId, dataset: DatasetId) -> Result<(), PolicyError>;

    /// Removes dataset membership. Returns true when no datasets remain.
    fn remove_dataset(&mut self, id: &PolicyId, dataset: &DatasetId) -> Result<bool, PolicyError>;

    fn ensure_group_id(&mut self, id: &PolicyId, group: GroupId) -> Result<(), PolicyError>;
}

/// HashMap-backed repository.
#[derive(Debug, Default)]
pub struct MemPolicyRepo {
    db: HashMap<PolicyId, PolicyData>,
    names: HashMap<String, PolicyId>,
}

impl MemPolicyRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    fn get_mut(&mut self, id: &PolicyId) -> Result<&mut PolicyData, PolicyError> {
        self.db.get_mut(id).ok_or_else(|| PolicyError::NotFound(id.clone()))
    }

    #[cfg(test)]
    fn indices_consistent(&self) -> bool {
        self.names.len() == self.db.len()
            && self
                .names
                .iter()
                .all(|(name, id)| self.db.get(id).is_some_and(|p| &p.name == name))
    }
}

impl PolicyRepository for MemPolicyRepo {
    fn exists(&self, id: &PolicyId) -> bool {
        self.db.contains_key(id)
    }

    fn get(&self, id: &PolicyId) -> Result<PolicyData, PolicyError> {
        self.db.get(id).cloned().ok_or_else(|| PolicyError::NotFound(id.clone()))
    }

    fn get_by_name(&self, name: &str) -> Result<PolicyData, PolicyError> {
        let id = self
            .names
            .get(name)
            .ok_or_else(|| PolicyError::NameNotFound(name.to_string()))?;
        self.get(id)
    }

    fn update(&mut self, data: PolicyData) -> Result<(), PolicyError> {
        if let Some(holder) = self.names.get(&data.name) {
            if *holder != data.id {
                return Err(PolicyError::NameConflict {
                    name: data.name,
                    holder: holder.clone(),
                });
            }
        }

        if let Some(previous) = self.db.get(&data.id) {
            self.names.remove(&previous.name);
        }
        self.names.insert(data.name.clone(), data.id.clone());
        self.db.insert(data.id.clone(), data);
        Ok(())
    }

    fn remove(&mut self, id: &PolicyId) -> Result<(), PolicyError> {
        let removed = self.db.remove(id).ok_or_else(|| PolicyError::NotFound(id.clone()))?;
        self.names.remove(&removed.name);
        Ok(())
    }

    fn get_all(&self) -> Vec<PolicyData> {
        self.db.values().cloned().collect()
    }

    fn ensure_dataset(&mut self, id: &PolicyId, dataset: DatasetId) -> Result<(), PolicyError> {
        self.get_mut(id)?.datasets.insert(dataset);
        Ok(())
    }

    fn remove_dataset(&mut self, id: &PolicyId, dataset: &DatasetId) -> Result<bool, PolicyError> {
        let policy = self.get_mut(id)?;
        policy.datasets.remove(dataset);
        Ok(policy.datasets.is_empty())
    }

    fn ensure_group_id(&mut self, id: &PolicyId, group: GroupId) -> Result<(), PolicyError> {
        self.get_mut(id)?.group_ids.insert(group);
        Ok(())
    }
}
