//! Task metadata carried explicitly down the call chain.
//!
//! Every unit of work the agent runs (startup, heartbeat, a remote command, a
//! backend restart) is described by an immutable [`TaskMeta`] value. It names
//! the routine, optionally carries a correlation [`TraceId`] and the agent's
//! identity, and renders itself as a tracing span so log lines emitted inside
//! the task are tagged with it.

use std::fmt;

use edge_id::{AgentId, TraceId};
use tracing::Span;

/// Immutable description of the task a piece of code is running under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMeta {
    routine: String,
    trace_id: Option<TraceId>,
    agent_id: Option<AgentId>,
}

impl TaskMeta {
    /// Metadata for a root routine with no trace ID.
    pub fn root(routine: impl Into<String>) -> Self {
        Self {
            routine: routine.into(),
            trace_id: None,
            agent_id: None,
        }
    }

    /// Same task, renamed to a different routine. Trace and identity are kept.
    #[must_use]
    pub fn with_routine(&self, routine: impl Into<String>) -> Self {
        Self {
            routine: routine.into(),
            ..self.clone()
        }
    }

    /// Derives a child task with a freshly generated correlation ID.
    #[must_use]
    pub fn traced(&self, routine: impl Into<String>) -> Self {
        Self {
            routine: routine.into(),
            trace_id: Some(TraceId::new()),
            agent_id: self.agent_id,
        }
    }

    /// Stamps the agent identity onto the metadata.
    #[must_use]
    pub fn with_agent(&self, agent_id: AgentId) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..self.clone()
        }
    }

    pub fn routine(&self) -> &str {
        &self.routine
    }

    pub fn trace_id(&self) -> Option<TraceId> {
        self.trace_id
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.agent_id
    }

    /// Span carrying the metadata as fields.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "task",
            routine = %self.routine,
            trace_id = self.trace_id.map(|t| t.to_string()),
            agent_id = self.agent_id.map(|a| a.to_string()),
        )
    }
}

impl fmt::Display for TaskMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.trace_id {
            Some(trace) => write!(f, "{}[{}]", self.routine, trace),
            None => f.write_str(&self.routine),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traced_child_gets_new_trace() {
        let root = TaskMeta::root("asyncParent").with_agent(AgentId::new());
        let a = root.traced("rpc");
        let b = root.traced("rpc");

        assert!(root.trace_id().is_none());
        assert!(a.trace_id().is_some());
        assert_ne!(a.trace_id(), b.trace_id());
        assert_eq!(a.agent_id(), root.agent_id());
    }

    #[test]
    fn test_with_routine_keeps_trace() {
        let task = TaskMeta::root("main").traced("heartbeat");
        let renamed = task.with_routine("restart");
        assert_eq!(renamed.trace_id(), task.trace_id());
        assert_eq!(renamed.routine(), "restart");
    }

    #[test]
    fn test_display() {
        assert_eq!(TaskMeta::root("main").to_string(), "main");
        let traced = TaskMeta::root("main").traced("rpc");
        assert!(traced.to_string().starts_with("rpc[trace_"));
    }
}
