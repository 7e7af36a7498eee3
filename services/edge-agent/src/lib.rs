//! Edge Agent Library
//!
//! The edge agent runs on a host next to a set of data-collection backends.
//! It starts and supervises those backends, hands them policies, reports
//! their health in periodic heartbeats, and restarts the ones that stay
//! unhealthy past a cool-down.
//!
//! ## Architecture
//!
//! ```text
//! Agent
//! ├── BackendRegistry   (named backend singletons)
//! ├── PolicyManager     (policy lifecycle over a shared repository)
//! ├── ConfigManager     (identity and transport credentials)
//! ├── Transport         (messaging boundary to the control plane)
//! └── heartbeat loop    (snapshot → derive → restart decision → publish)
//! ```
//!
//! ## Modules
//!
//! - `agent`: orchestration, restarts, shutdown, command dispatch
//! - `backend`: backend capability trait, process supervisor, control-surface client
//! - `policy`: repository and manager
//! - `heartbeat`: heartbeat record and health loop

pub mod agent;
pub mod backend;
pub mod comms;
pub mod config;
pub mod config_manager;
pub mod heartbeat;
pub mod policy;
pub mod rpc;
pub mod task;

pub use agent::{Agent, AgentError, GroupInfo};
pub use config::{Config, ConfigError};
