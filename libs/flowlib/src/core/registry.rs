use crate::core::error::{FlowError, Result};
use crate::core::node::NodeKind;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Process-wide registry of node names.
///
/// Every node registers its name at construction and unregisters at drop,
/// which is what makes name-based parent and peer references safe to
/// resolve. Duplicate names are rejected at registration.
pub struct NodeRegistry {
    nodes: HashMap<String, NodeKind>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, kind: NodeKind) -> Result<()> {
        if self.nodes.contains_key(name) {
            return Err(FlowError::Configuration(format!(
                "Node '{name}' is already registered"
            )));
        }
        self.nodes.insert(name.to_string(), kind);
        debug!(node = name, %kind, "registered node");
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Option<NodeKind> {
        let removed = self.nodes.remove(name);
        if removed.is_some() {
            debug!(node = name, "unregistered node");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn kind(&self, name: &str) -> Option<NodeKind> {
        self.nodes.get(name).copied()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Deterministic teardown for tests and process shutdown. Nodes alive
    /// after a clear will silently skip their unregister at drop.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<Mutex<NodeRegistry>>> = OnceLock::new();

/// The process-wide registry instance.
pub fn global_registry() -> Arc<Mutex<NodeRegistry>> {
    GLOBAL_REGISTRY
        .get_or_init(|| Arc::new(Mutex::new(NodeRegistry::new())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let mut registry = NodeRegistry::new();
        registry.register("registry_test_a", NodeKind::Queue).unwrap();
        assert!(registry.contains("registry_test_a"));
        assert_eq!(registry.kind("registry_test_a"), Some(NodeKind::Queue));
        assert_eq!(registry.unregister("registry_test_a"), Some(NodeKind::Queue));
        assert!(!registry.contains("registry_test_a"));
        assert_eq!(registry.unregister("registry_test_a"), None);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = NodeRegistry::new();
        registry.register("registry_test_dup", NodeKind::Tee).unwrap();
        let err = registry
            .register("registry_test_dup", NodeKind::Sink)
            .unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
        // The original registration survives.
        assert_eq!(registry.kind("registry_test_dup"), Some(NodeKind::Tee));
    }

    #[test]
    fn test_global_registry_enforces_uniqueness() {
        let registry = global_registry();
        registry
            .lock()
            .register("registry_test_global_unique", NodeKind::Bin)
            .unwrap();
        let err = registry
            .lock()
            .register("registry_test_global_unique", NodeKind::Bin)
            .unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
        registry.lock().unregister("registry_test_global_unique");
    }

    #[test]
    fn test_list_is_sorted() {
        let mut registry = NodeRegistry::new();
        registry.register("registry_test_b", NodeKind::Queue).unwrap();
        registry.register("registry_test_1", NodeKind::Queue).unwrap();
        assert_eq!(
            registry.list(),
            vec!["registry_test_1".to_string(), "registry_test_b".to_string()]
        );
        registry.clear();
        assert!(registry.is_empty());
    }
}
