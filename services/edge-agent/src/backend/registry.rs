//! Name to backend lookup table.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::{Backend, ProcessBackend, ProcessBackendSpec};

/// Backends known to the agent, keyed by registry name.
///
/// Built once by the entry point and finished before the agent starts; the
/// last registration for a name wins.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every production backend kind. Test doubles are
    /// registered explicitly by the harness that needs them.
    pub fn with_default_backends() -> Self {
        let mut registry = Self::new();
        for spec in [
            ProcessBackendSpec::network_discovery(),
            ProcessBackendSpec::device_discovery(),
            ProcessBackendSpec::pktvisor(),
        ] {
            let name = spec.kind.clone();
            registry.register(name, Arc::new(ProcessBackend::new(spec)));
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn Backend>) {
        let name = name.into();
        if self.backends.insert(name.clone(), backend).is_some() {
            debug!(backend = %name, "backend registration replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
