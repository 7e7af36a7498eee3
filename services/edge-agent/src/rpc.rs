//! Commands received from the control plane and requests sent to it.
//!
//! Decoding of the wire format belongs to the transport; by the time a
//! command reaches the agent it is one of the typed variants below.

use std::collections::BTreeMap;

use edge_id::{DatasetId, GroupId, PolicyId};
use serde::{Deserialize, Serialize};

use crate::policy::PolicyCommand;

/// Schema version stamped on every outbound request.
pub const REQUEST_SCHEMA_VERSION: &str = "1.0";

/// One remote group the agent belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group_id: GroupId,
    pub name: String,
    pub channel_id: String,
}

/// Command delivered on the agent's RPC topic.
#[derive(Debug, Clone)]
pub enum AgentCommand {
    /// Group memberships. A full list replaces what the agent knows.
    GroupMembership {
        full_list: bool,
        groups: Vec<GroupMembership>,
    },

    GroupRemoved { group_id: GroupId },

    /// Policies to manage or remove. A full list also removes every known
    /// policy it does not mention.
    AgentPolicies {
        full_list: bool,
        policies: Vec<PolicyCommand>,
    },

    DatasetRemoved {
        dataset_id: DatasetId,
        policy_id: PolicyId,
    },

    AgentStop { reason: String },

    /// Partial reset restarts the heartbeat only; full reset restarts every
    /// backend as well.
    AgentReset { full_reset: bool, reason: String },
}

impl AgentCommand {
    /// Short name used as the routine of the task handling the command.
    pub fn routine(&self) -> &'static str {
        match self {
            AgentCommand::GroupMembership { .. } => "rpc.group_membership",
            AgentCommand::GroupRemoved { .. } => "rpc.group_removed",
            AgentCommand::AgentPolicies { .. } => "rpc.agent_policies",
            AgentCommand::DatasetRemoved { .. } => "rpc.dataset_removed",
            AgentCommand::AgentStop { .. } => "rpc.agent_stop",
            AgentCommand::AgentReset { .. } => "rpc.agent_reset",
        }
    }
}

/// Outbound request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestFunc {
    AgentCapabilities,
    GroupMembershipReq,
    AgentPoliciesReq,
}

/// Envelope for anything the agent sends to the control plane besides
/// heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub schema_version: String,
    pub func: RequestFunc,
    pub payload: serde_json::Value,
}

impl AgentRequest {
    pub fn new(func: RequestFunc, payload: serde_json::Value) -> Self {
        Self {
            schema_version: REQUEST_SCHEMA_VERSION.to_string(),
            func,
            payload,
        }
    }
}

/// What one backend reports about itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub version: String,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Payload of [`RequestFunc::AgentCapabilities`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub agent_version: String,
    pub backends: BTreeMap<String, BackendCapabilities>,
    pub tags: BTreeMap<String, String>,
}
