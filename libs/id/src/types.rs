//! Identifier types used across the edge agent.

use crate::{define_handle, define_id};

define_id!(
    /// Identity of this agent as known to the control plane.
    AgentId,
    "agent"
);
define_handle!(
    /// Opaque handle of an applied policy.
    PolicyId,
    "pol"
);
define_handle!(
    /// Control-plane dataset that references one or more policies.
    DatasetId,
    "ds"
);
define_handle!(
    /// Remote agent group this agent is a member of.
    GroupId,
    "grp"
);
define_id!(
    /// Correlation identifier attached to one unit of asynchronous work.
    TraceId,
    "trace"
);
