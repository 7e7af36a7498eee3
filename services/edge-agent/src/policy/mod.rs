//! Policies: the data model, the reported state machine, the repository and
//! the manager that applies them to backends.

mod manager;
mod repo;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use edge_id::{DatasetId, GroupId, PolicyId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub use manager::{LocalPolicyManager, PolicyAction, PolicyCommand, PolicyManager};
pub use repo::{MemPolicyRepo, PolicyRepository};

/// Repository handle shared between the manager, backends and the heartbeat.
///
/// The repository does no locking of its own; the lock lives here.
pub type SharedPolicyRepo = Arc<RwLock<dyn PolicyRepository>>;

/// Synthetic error attached to policies whose backend is not running.
pub const BACKEND_UNREACHABLE: &str = "backend is unreachable";

/// Errors from the policy repository and manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("unknown policy ID: {0}")]
    NotFound(PolicyId),

    #[error("policy name not found: {0}")]
    NameNotFound(String),

    #[error("policy name {name} already used by {holder}")]
    NameConflict { name: String, holder: PolicyId },

    #[error("policy references unknown backend: {0}")]
    UnknownBackend(String),

    #[error("invalid policy payload: {0}")]
    InvalidPayload(String),
}

/// Reported state of a policy.
///
/// The discriminants are the wire ordinals and must never be reordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PolicyState {
    #[default]
    Unknown = 0,
    Running = 1,
    FailedToApply = 2,
    Offline = 3,
    NoTapMatch = 4,
}

impl PolicyState {
    pub const ALL: [PolicyState; 5] = [
        PolicyState::Unknown,
        PolicyState::Running,
        PolicyState::FailedToApply,
        PolicyState::Offline,
        PolicyState::NoTapMatch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PolicyState::Unknown => "unknown",
            PolicyState::Running => "running",
            PolicyState::FailedToApply => "failed_to_apply",
            PolicyState::Offline => "offline",
            PolicyState::NoTapMatch => "no_tap_match",
        }
    }

    /// Decodes a wire string. Anything unrecognized is `Unknown`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "running" => PolicyState::Running,
            "failed_to_apply" => PolicyState::FailedToApply,
            "offline" => PolicyState::Offline,
            "no_tap_match" => PolicyState::NoTapMatch,
            _ => PolicyState::Unknown,
        }
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Decodes a wire ordinal. Out-of-range values are `Unknown`.
    pub fn from_ordinal(ordinal: u8) -> Self {
        Self::ALL
            .get(ordinal as usize)
            .copied()
            .unwrap_or(PolicyState::Unknown)
    }
}

impl fmt::Display for PolicyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PolicyState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PolicyState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(PolicyState::from_wire(&s))
    }
}

/// How the policy's current name relates to what the backend has applied.
///
/// Backends key configuration by name, so after a rename the old name is the
/// one that has to be removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PolicyTransition {
    #[default]
    Applied,
    Renamed { from: String },
}

/// A policy as held by the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyData {
    pub id: PolicyId,
    pub name: String,
    pub backend: String,
    pub version: i32,
    pub data: serde_json::Value,
    pub state: PolicyState,
    pub datasets: BTreeSet<DatasetId>,
    pub group_ids: BTreeSet<GroupId>,
    pub backend_err: Option<String>,
    pub last_scrape_bytes: i64,
    pub last_scrape_ts: Option<DateTime<Utc>>,
    pub transition: PolicyTransition,
}

impl PolicyData {
    pub fn new(
        id: PolicyId,
        name: impl Into<String>,
        backend: impl Into<String>,
        version: i32,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            backend: backend.into(),
            version,
            data,
            state: PolicyState::Unknown,
            datasets: BTreeSet::new(),
            group_ids: BTreeSet::new(),
            backend_err: None,
            last_scrape_bytes: 0,
            last_scrape_ts: None,
            transition: PolicyTransition::Applied,
        }
    }

    /// Name the backend currently knows this policy by.
    pub fn removal_name(&self) -> &str {
        match &self.transition {
            PolicyTransition::Renamed { from } => from,
            PolicyTransition::Applied => &self.name,
        }
    }

    pub fn dataset_ids(&self) -> Vec<DatasetId> {
        self.datasets.iter().cloned().collect()
    }
}
