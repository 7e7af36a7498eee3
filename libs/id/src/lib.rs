//! # edge-id
//!
//! Typed identifiers used by the edge agent and its control plane.
//!
//! Identifiers the agent owns (`AgentId`, `TraceId`) are strict prefixed
//! ULIDs, `{prefix}_{ulid}`:
//!
//! - `agent_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `trace_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! Handles issued by the control plane (`PolicyId`, `DatasetId`, `GroupId`)
//! are opaque. Locally minted ones follow the same prefixed ULID shape, but
//! any non-empty token coming off the wire is kept verbatim.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
