use crate::core::error::{FlowError, Result};
use crate::core::node::{link_nodes, unlink_nodes, FlowNode, NodeCore, NodeKind};
use crate::core::port::{LinkState, Port, PortRole};
use std::any::Any;
use tracing::{debug, info};

/// A boundary port exported from a child.
#[derive(Debug, Clone)]
struct GhostPort {
    name: String,
    role: PortRole,
    child: String,
    child_port: String,
}

/// Container of nodes linked as a chain.
///
/// Children are owned exclusively and linked pairwise in insertion order,
/// `child[i].src -> child[i+1].sink`. Ghost ports export a child's port
/// under a boundary name so the bin can be linked like any other node.
pub struct Bin {
    core: NodeCore,
    children: Vec<Box<dyn FlowNode>>,
    ghosts: Vec<GhostPort>,
    linked: bool,
}

impl Bin {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            core: NodeCore::new(name, NodeKind::Bin)?,
            children: Vec::new(),
            ghosts: Vec::new(),
            linked: false,
        })
    }

    /// Add a child to the end of the chain. The bin takes ownership and
    /// becomes the child's parent.
    pub fn add_child(&mut self, mut child: Box<dyn FlowNode>) -> Result<()> {
        if self.linked {
            return Err(FlowError::NotSupported(format!(
                "'{}' does not support adding children while linked",
                self.core.name()
            )));
        }
        if self.child_index(child.name()).is_some() {
            return Err(FlowError::Structure(format!(
                "'{}' already contains a child named '{}'",
                self.core.name(),
                child.name()
            )));
        }
        child.core_mut().assign_parent(self.core.name())?;
        debug!(bin = %self.core.name(), child = %child.name(), "added child");
        self.children.push(child);
        Ok(())
    }

    /// Remove a child by name. The child must be unlinked and must not be
    /// exported through a ghost port.
    pub fn remove_child(&mut self, name: &str) -> Result<Box<dyn FlowNode>> {
        let idx = self.child_index(name).ok_or_else(|| {
            FlowError::NotFound(format!(
                "'{}' has no child named '{name}'",
                self.core.name()
            ))
        })?;
        if self.children[idx].link_state() != LinkState::Unlinked {
            return Err(FlowError::Structure(format!(
                "child '{name}' of '{}' is still linked",
                self.core.name()
            )));
        }
        if self.ghosts.iter().any(|g| g.child == name) {
            return Err(FlowError::Structure(format!(
                "child '{name}' of '{}' is still exported as a ghost port",
                self.core.name()
            )));
        }
        let mut child = self.children.remove(idx);
        child.core_mut().clear_parent();
        debug!(bin = %self.core.name(), child = name, "removed child");
        Ok(child)
    }

    pub fn child(&self, name: &str) -> Option<&dyn FlowNode> {
        self.children
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.as_ref())
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Box<dyn FlowNode>> {
        self.children.iter_mut().find(|c| c.name() == name)
    }

    pub fn child_names(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.name()).collect()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Export `child`'s `child_port` under the boundary name `name`.
    pub fn add_ghost_port(&mut self, name: &str, child: &str, child_port: &str) -> Result<()> {
        if self.ghosts.iter().any(|g| g.name == name) || self.core.port(name).is_some() {
            return Err(FlowError::Structure(format!(
                "'{}' already has a boundary port named '{name}'",
                self.core.name()
            )));
        }
        let role = {
            let bin = self.core.name().to_string();
            let node = self.child_mut(child).ok_or_else(|| {
                FlowError::NotFound(format!("'{bin}' has no child named '{child}'"))
            })?;
            node.boundary_port_mut(child_port)?.role()
        };
        self.ghosts.push(GhostPort {
            name: name.to_string(),
            role,
            child: child.to_string(),
            child_port: child_port.to_string(),
        });
        debug!(
            bin = %self.core.name(),
            ghost = name,
            target = %format_args!("{child}.{child_port}"),
            "added ghost port"
        );
        Ok(())
    }

    pub fn remove_ghost_port(&mut self, name: &str) -> Result<()> {
        let idx = self
            .ghosts
            .iter()
            .position(|g| g.name == name)
            .ok_or_else(|| {
                FlowError::NotFound(format!(
                    "'{}' has no ghost port named '{name}'",
                    self.core.name()
                ))
            })?;
        let ghost = &self.ghosts[idx];
        if let Some(child) = self.child(&ghost.child) {
            if let Ok(port) = child.boundary_port(&ghost.child_port) {
                if port.is_linked() {
                    return Err(FlowError::Structure(format!(
                        "ghost port '{name}' of '{}' is still linked",
                        self.core.name()
                    )));
                }
            }
        }
        self.ghosts.remove(idx);
        Ok(())
    }

    pub fn ghost_port_names(&self) -> Vec<&str> {
        self.ghosts.iter().map(|g| g.name.as_str()).collect()
    }

    fn child_index(&self, name: &str) -> Option<usize> {
        self.children.iter().position(|c| c.name() == name)
    }

    fn resolve_ghost(&self, name: &str) -> Option<GhostPort> {
        self.ghosts.iter().find(|g| g.name == name).cloned()
    }
}

impl FlowNode for Bin {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn boundary_port(&self, name: &str) -> Result<&Port> {
        if let Some(ghost) = self.resolve_ghost(name) {
            let child = self.child(&ghost.child).ok_or_else(|| {
                FlowError::NotFound(format!(
                    "ghost port '{name}' of '{}' points at missing child '{}'",
                    self.core.name(),
                    ghost.child
                ))
            })?;
            return child.boundary_port(&ghost.child_port);
        }
        self.core.require_port(name)
    }

    fn boundary_port_mut(&mut self, name: &str) -> Result<&mut Port> {
        if let Some(ghost) = self.resolve_ghost(name) {
            let bin = self.core.name().to_string();
            let child = self.child_mut(&ghost.child).ok_or_else(|| {
                FlowError::NotFound(format!(
                    "ghost port '{name}' of '{bin}' points at missing child '{}'",
                    ghost.child
                ))
            })?;
            return child.boundary_port_mut(&ghost.child_port);
        }
        self.core.require_port_mut(name)
    }

    fn link_state(&self) -> LinkState {
        let mut upstream = false;
        let mut downstream = false;
        for ghost in &self.ghosts {
            let linked = self
                .child(&ghost.child)
                .and_then(|c| c.boundary_port(&ghost.child_port).ok())
                .is_some_and(|p| p.is_linked());
            if linked {
                match ghost.role {
                    PortRole::Sink => upstream = true,
                    PortRole::Source => downstream = true,
                }
            }
        }
        match (upstream, downstream) {
            (false, false) => LinkState::Unlinked,
            (true, false) => LinkState::LinkedToSource,
            (false, true) => LinkState::LinkedToSink,
            (true, true) => LinkState::FullyLinked,
        }
    }

    /// Link children internally, then pairwise in declared order. Stops at
    /// the first failure; pairs linked before the failure stay linked.
    fn link_all(&mut self) -> Result<()> {
        if self.linked {
            return Err(FlowError::State(format!(
                "'{}' is already linked",
                self.core.name()
            )));
        }
        for child in self.children.iter_mut() {
            child.link_all()?;
        }
        for i in 0..self.children.len().saturating_sub(1) {
            let (left, right) = self.children.split_at_mut(i + 1);
            let src = left[i].as_mut();
            let dst = right[0].as_mut();
            let pair = format!("'{}' -> '{}'", src.name(), dst.name());
            if let Err(e) = link_nodes(src, "src", dst, "sink") {
                return Err(FlowError::Structure(format!(
                    "'{}' failed linking {pair}: {e}",
                    self.core.name()
                )));
            }
        }
        self.linked = true;
        info!(bin = %self.core.name(), children = self.children.len(), "linked");
        Ok(())
    }

    /// Unlink children in strict reverse order. A pair that is already
    /// unlinked is tolerated; calling this on an unlinked bin is an error.
    fn unlink_all(&mut self) -> Result<()> {
        if !self.linked {
            return Err(FlowError::State(format!(
                "'{}' is not linked",
                self.core.name()
            )));
        }
        for i in (0..self.children.len().saturating_sub(1)).rev() {
            let (left, right) = self.children.split_at_mut(i + 1);
            let src = left[i].as_mut();
            let dst = right[0].as_mut();
            let pair_linked = src.boundary_port("src").map(|p| p.is_linked()).unwrap_or(false);
            if !pair_linked {
                debug!(bin = %self.core.name(), src = %src.name(), "pair already unlinked");
                continue;
            }
            unlink_nodes(src, "src", dst, "sink")?;
        }
        for child in self.children.iter_mut().rev() {
            match child.unlink_all() {
                Ok(()) => {}
                Err(FlowError::State(_)) => {
                    debug!(bin = %self.core.name(), child = %child.name(), "child already unlinked");
                }
                Err(e) => return Err(e),
            }
        }
        self.linked = false;
        info!(bin = %self.core.name(), "unlinked");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        // Downstream children first so nothing pushes into a stopped stage.
        for child in self.children.iter_mut().rev() {
            child.start()?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        for child in self.children.iter_mut() {
            child.stop()?;
        }
        Ok(())
    }

    fn rewire(&mut self) {
        for child in self.children.iter_mut() {
            child.rewire();
        }
    }

    fn attach_bus(&mut self, bus: &crate::core::pipeline::BusSender) {
        for child in self.children.iter_mut() {
            child.attach_bus(bus);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
