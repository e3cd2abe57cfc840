use crate::core::error::{FlowError, Result};
use crate::core::port::{
    link_ports, unlink_ports, LinkState, Port, PortRole, DEFAULT_LINK_CAPACITY,
};
use crate::core::registry::global_registry;
use serde::{Deserialize, Serialize};
use std::any::Any;
use tracing::{debug, warn};

/// What a node is, for registry listings and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Source,
    Queue,
    Tee,
    Demuxer,
    Muxer,
    Remuxer,
    Bin,
    Sink,
    Pipeline,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Queue => write!(f, "queue"),
            Self::Tee => write!(f, "tee"),
            Self::Demuxer => write!(f, "demuxer"),
            Self::Muxer => write!(f, "muxer"),
            Self::Remuxer => write!(f, "remuxer"),
            Self::Bin => write!(f, "bin"),
            Self::Sink => write!(f, "sink"),
            Self::Pipeline => write!(f, "pipeline"),
        }
    }
}

/// Shared identity and port table for every node.
///
/// Names are process-unique: construction registers the name in the global
/// registry and drop unregisters it. The parent back-reference is a name,
/// not a pointer; ownership of children always lives in the container.
#[derive(Debug)]
pub struct NodeCore {
    name: String,
    kind: NodeKind,
    parent: Option<String>,
    ports: Vec<Port>,
}

impl NodeCore {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Result<Self> {
        let name = name.into();
        global_registry().lock().register(&name, kind)?;
        Ok(Self {
            name,
            kind,
            parent: None,
            ports: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub(crate) fn assign_parent(&mut self, parent: &str) -> Result<()> {
        if let Some(existing) = &self.parent {
            return Err(FlowError::Structure(format!(
                "node '{}' is already a child of '{}'",
                self.name, existing
            )));
        }
        self.parent = Some(parent.to_string());
        Ok(())
    }

    pub(crate) fn clear_parent(&mut self) {
        self.parent = None;
    }

    pub fn add_port(&mut self, port: Port) -> Result<()> {
        if self.ports.iter().any(|p| p.name() == port.name()) {
            return Err(FlowError::Structure(format!(
                "node '{}' already has a port named '{}'",
                self.name,
                port.name()
            )));
        }
        debug!(node = %self.name, port = %port.name(), role = %port.role(), "added port");
        self.ports.push(port);
        Ok(())
    }

    /// Remove a port. Linked ports must be unlinked first.
    pub fn remove_port(&mut self, name: &str) -> Result<Port> {
        let idx = self
            .ports
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| {
                FlowError::NotFound(format!("port '{}' not found on '{}'", name, self.name))
            })?;
        if self.ports[idx].is_linked() {
            return Err(FlowError::Structure(format!(
                "port '{}.{}' is still linked, unlink it before removal",
                self.name, name
            )));
        }
        Ok(self.ports.remove(idx))
    }

    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name() == name)
    }

    pub fn port_mut(&mut self, name: &str) -> Option<&mut Port> {
        self.ports.iter_mut().find(|p| p.name() == name)
    }

    pub fn require_port(&self, name: &str) -> Result<&Port> {
        let node = self.name.clone();
        self.port(name)
            .ok_or_else(|| FlowError::NotFound(format!("port '{name}' not found on '{node}'")))
    }

    pub fn require_port_mut(&mut self, name: &str) -> Result<&mut Port> {
        let node = self.name.clone();
        self.port_mut(name)
            .ok_or_else(|| FlowError::NotFound(format!("port '{name}' not found on '{node}'")))
    }

    pub fn port_names(&self) -> Vec<&str> {
        self.ports.iter().map(|p| p.name()).collect()
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// Link summary derived from the current port peers.
    pub fn link_state(&self) -> LinkState {
        let upstream = self
            .ports
            .iter()
            .any(|p| p.role() == PortRole::Sink && p.is_linked());
        let downstream = self
            .ports
            .iter()
            .any(|p| p.role() == PortRole::Source && p.is_linked());
        match (upstream, downstream) {
            (false, false) => LinkState::Unlinked,
            (true, false) => LinkState::LinkedToSource,
            (false, true) => LinkState::LinkedToSink,
            (true, true) => LinkState::FullyLinked,
        }
    }
}

impl Drop for NodeCore {
    fn drop(&mut self) {
        let state = self.link_state();
        if state != LinkState::Unlinked {
            warn!(node = %self.name, %state, "node dropped while still linked");
        }
        global_registry().lock().unregister(&self.name);
    }
}

/// Capability surface shared by every node in the graph.
///
/// Containers forward `link_all`/`unlink_all` to their children; leaf
/// nodes use the defaults. `rewire` lets active nodes refresh the channel
/// endpoints their worker threads read after a port changed.
pub trait FlowNode: Send {
    fn core(&self) -> &NodeCore;
    fn core_mut(&mut self) -> &mut NodeCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn kind(&self) -> NodeKind {
        self.core().kind()
    }

    fn parent(&self) -> Option<&str> {
        self.core().parent()
    }

    fn link_state(&self) -> LinkState {
        self.core().link_state()
    }

    /// Resolve a boundary port name to the port that carries the data.
    /// Containers override this to look through their ghost ports.
    fn boundary_port(&self, name: &str) -> Result<&Port> {
        self.core().require_port(name)
    }

    fn boundary_port_mut(&mut self, name: &str) -> Result<&mut Port> {
        self.core_mut().require_port_mut(name)
    }

    /// Wire internal structure (children, internal stages). No-op for
    /// leaf nodes without internal links.
    fn link_all(&mut self) -> Result<()> {
        Ok(())
    }

    fn unlink_all(&mut self) -> Result<()> {
        Ok(())
    }

    /// Start worker threads. Starting an already-started node is a no-op.
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop worker threads and join them. Idempotent.
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Refresh worker-facing channel endpoints from the current port
    /// state. Called after any link or unlink touching this node.
    fn rewire(&mut self) {}

    /// Hand this node a pipeline bus endpoint for asynchronous messages.
    fn attach_bus(&mut self, _bus: &crate::core::pipeline::BusSender) {}

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl std::fmt::Debug for dyn FlowNode + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowNode")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Link `src`'s source port to `dst`'s sink port with the default
/// capacity, resolving ghost ports on either side.
pub fn link_nodes(
    src: &mut dyn FlowNode,
    src_port: &str,
    dst: &mut dyn FlowNode,
    dst_port: &str,
) -> Result<()> {
    link_nodes_with_capacity(src, src_port, dst, dst_port, DEFAULT_LINK_CAPACITY)
}

pub fn link_nodes_with_capacity(
    src: &mut dyn FlowNode,
    src_port: &str,
    dst: &mut dyn FlowNode,
    dst_port: &str,
    capacity: usize,
) -> Result<()> {
    let src_name = src.name().to_string();
    let dst_name = dst.name().to_string();
    {
        let sp = src.boundary_port_mut(src_port)?;
        let dp = dst.boundary_port_mut(dst_port)?;
        link_ports(&src_name, sp, &dst_name, dp, capacity)?;
    }
    src.rewire();
    dst.rewire();
    Ok(())
}

/// Undo a [`link_nodes`] connection.
pub fn unlink_nodes(
    src: &mut dyn FlowNode,
    src_port: &str,
    dst: &mut dyn FlowNode,
    dst_port: &str,
) -> Result<()> {
    let src_name = src.name().to_string();
    let dst_name = dst.name().to_string();
    {
        let sp = src.boundary_port_mut(src_port)?;
        let dp = dst.boundary_port_mut(dst_port)?;
        unlink_ports(&src_name, sp, &dst_name, dp)?;
    }
    src.rewire();
    dst.rewire();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_port_name_rejected() {
        let mut core = NodeCore::new("node_test_dup_port", NodeKind::Queue).unwrap();
        core.add_port(Port::new_static("sink", PortRole::Sink))
            .unwrap();
        let err = core
            .add_port(Port::new_static("sink", PortRole::Sink))
            .unwrap_err();
        assert!(matches!(err, FlowError::Structure(_)));
    }

    #[test]
    fn test_link_state_derived_from_ports() {
        let mut a = NodeCore::new("node_test_state_a", NodeKind::Queue).unwrap();
        a.add_port(Port::new_static("sink", PortRole::Sink)).unwrap();
        a.add_port(Port::new_static("src", PortRole::Source)).unwrap();
        let mut b = NodeCore::new("node_test_state_b", NodeKind::Queue).unwrap();
        b.add_port(Port::new_static("sink", PortRole::Sink)).unwrap();

        assert_eq!(a.link_state(), LinkState::Unlinked);
        link_ports(
            "node_test_state_a",
            a.port_mut("src").unwrap(),
            "node_test_state_b",
            b.port_mut("sink").unwrap(),
            4,
        )
        .unwrap();
        assert_eq!(a.link_state(), LinkState::LinkedToSink);
        assert_eq!(b.link_state(), LinkState::LinkedToSource);
    }

    #[test]
    fn test_remove_linked_port_rejected() {
        let mut a = NodeCore::new("node_test_rm_a", NodeKind::Tee).unwrap();
        a.add_port(Port::new_on_demand("src_0", PortRole::Source))
            .unwrap();
        let mut b = NodeCore::new("node_test_rm_b", NodeKind::Queue).unwrap();
        b.add_port(Port::new_static("sink", PortRole::Sink)).unwrap();
        link_ports(
            "node_test_rm_a",
            a.port_mut("src_0").unwrap(),
            "node_test_rm_b",
            b.port_mut("sink").unwrap(),
            4,
        )
        .unwrap();

        let err = a.remove_port("src_0").unwrap_err();
        assert!(matches!(err, FlowError::Structure(_)));
    }

    #[test]
    fn test_parent_is_exclusive() {
        let mut core = NodeCore::new("node_test_parent", NodeKind::Queue).unwrap();
        core.assign_parent("bin_one").unwrap();
        let err = core.assign_parent("bin_two").unwrap_err();
        assert!(matches!(err, FlowError::Structure(_)));
        core.clear_parent();
        core.assign_parent("bin_two").unwrap();
        assert_eq!(core.parent(), Some("bin_two"));
    }
}
