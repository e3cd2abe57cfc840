use crate::core::demux::parse_stream_id;
use crate::core::error::{FlowError, Result};
use crate::core::events::ListenerSet;
use crate::core::node::{
    link_nodes, link_nodes_with_capacity, unlink_nodes, FlowNode, NodeCore, NodeKind,
};
use crate::core::port::LinkState;
use crate::core::sink::{attach_sink, detach_sink, TerminalNode};
use crate::core::tee::Tee;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Null,
    Ready,
    Paused,
    Playing,
    Error,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Null => "null",
            PipelineState::Ready => "ready",
            PipelineState::Paused => "paused",
            PipelineState::Playing => "playing",
            PipelineState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Out-of-band notification from a worker thread to the control path.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Eos { node: String },
    Error { node: String, message: String },
}

pub type BusSender = Sender<BusMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub old: PipelineState,
    pub new: PipelineState,
}

#[derive(Debug, Clone, Serialize)]
pub struct EosEvent {
    pub node: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub node: String,
    pub message: String,
}

/// Top-level graph: owns the member nodes, walks them through the
/// Null / Ready / Paused / Playing ladder, and drains the message bus.
///
/// Members are added upstream first; starting walks them in reverse so
/// every consumer is running before its producer, and stopping walks
/// forward so producers quiesce first. Sources hold back until the
/// Playing step, which is what makes Paused a preroll state.
///
/// Control calls are not internally serialized; one thread drives the
/// pipeline. Worker threads only ever touch the bus.
pub struct Pipeline {
    core: NodeCore,
    nodes: Vec<Box<dyn FlowNode>>,
    state: PipelineState,
    bus_tx: BusSender,
    bus_rx: Receiver<BusMessage>,
    state_listeners: ListenerSet<StateTransition>,
    eos_listeners: ListenerSet<EosEvent>,
    error_listeners: ListenerSet<ErrorEvent>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let core = NodeCore::new(&name, NodeKind::Pipeline)?;
        let (bus_tx, bus_rx) = unbounded();
        Ok(Self {
            core,
            nodes: Vec::new(),
            state: PipelineState::Null,
            bus_tx,
            bus_rx,
            state_listeners: ListenerSet::new(&name),
            eos_listeners: ListenerSet::new(&name),
            error_listeners: ListenerSet::new(&name),
        })
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Endpoint nodes use to post asynchronous notifications.
    pub fn bus_sender(&self) -> BusSender {
        self.bus_tx.clone()
    }

    pub fn add_state_listener(
        &mut self,
        callback: impl FnMut(&StateTransition) + Send + 'static,
    ) -> u64 {
        self.state_listeners.add(callback)
    }

    pub fn remove_state_listener(&mut self, id: u64) -> bool {
        self.state_listeners.remove(id)
    }

    pub fn add_eos_listener(&mut self, callback: impl FnMut(&EosEvent) + Send + 'static) -> u64 {
        self.eos_listeners.add(callback)
    }

    pub fn remove_eos_listener(&mut self, id: u64) -> bool {
        self.eos_listeners.remove(id)
    }

    pub fn add_error_listener(
        &mut self,
        callback: impl FnMut(&ErrorEvent) + Send + 'static,
    ) -> u64 {
        self.error_listeners.add(callback)
    }

    pub fn remove_error_listener(&mut self, id: u64) -> bool {
        self.error_listeners.remove(id)
    }

    fn check_mutable(&self, operation: &str) -> Result<()> {
        match self.state {
            PipelineState::Null | PipelineState::Ready => Ok(()),
            state => Err(FlowError::State(format!(
                "cannot {operation} while '{}' is {state}",
                self.core.name()
            ))),
        }
    }

    /// Take ownership of a node. Members are wired with `link` and
    /// started by `play`; add them upstream first.
    pub fn add_node(&mut self, mut node: Box<dyn FlowNode>) -> Result<()> {
        self.check_mutable("add a node")?;
        let name = node.name().to_string();
        if self.nodes.iter().any(|n| n.name() == name) {
            return Err(FlowError::Structure(format!(
                "'{}' already contains a node named '{name}'",
                self.core.name()
            )));
        }
        node.core_mut().assign_parent(self.core.name())?;
        node.attach_bus(&self.bus_tx);
        debug!(pipeline = %self.core.name(), node = %name, "node added");
        self.nodes.push(node);
        Ok(())
    }

    /// Hand a node back. It must be fully unlinked first.
    pub fn remove_node(&mut self, name: &str) -> Result<Box<dyn FlowNode>> {
        self.check_mutable("remove a node")?;
        let idx = self
            .nodes
            .iter()
            .position(|n| n.name() == name)
            .ok_or_else(|| {
                FlowError::NotFound(format!(
                    "node '{name}' not found in '{}'",
                    self.core.name()
                ))
            })?;
        if self.nodes[idx].link_state() != LinkState::Unlinked {
            return Err(FlowError::Structure(format!(
                "node '{name}' is still linked, unlink it before removal"
            )));
        }
        let mut node = self.nodes.remove(idx);
        node.core_mut().clear_parent();
        debug!(pipeline = %self.core.name(), node = name, "node removed");
        Ok(node)
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name()).collect()
    }

    pub fn node(&self, name: &str) -> Option<&dyn FlowNode> {
        self.nodes
            .iter()
            .find(|n| n.name() == name)
            .map(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut (dyn FlowNode + 'static)> {
        self.nodes
            .iter_mut()
            .find(|n| n.name() == name)
            .map(|n| n.as_mut())
    }

    /// Borrow a member as its concrete type.
    pub fn node_as_mut<T: 'static>(&mut self, name: &str) -> Result<&mut T> {
        let pipeline = self.core.name().to_string();
        let node = self
            .node_mut(name)
            .ok_or_else(|| FlowError::NotFound(format!("node '{name}' not found in '{pipeline}'")))?;
        node.as_any_mut().downcast_mut::<T>().ok_or_else(|| {
            FlowError::NotSupported(format!(
                "node '{name}' is not a {}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Wire `src.src` to `dst.sink` between two members.
    pub fn link(&mut self, src: &str, dst: &str) -> Result<()> {
        self.check_mutable("link nodes")?;
        let (a, b) = self.pair_mut(src, dst)?;
        link_nodes(a.as_mut(), "src", b.as_mut(), "sink")
    }

    pub fn link_with_capacity(&mut self, src: &str, dst: &str, capacity: usize) -> Result<()> {
        self.check_mutable("link nodes")?;
        let (a, b) = self.pair_mut(src, dst)?;
        link_nodes_with_capacity(a.as_mut(), "src", b.as_mut(), "sink", capacity)
    }

    pub fn unlink(&mut self, src: &str, dst: &str) -> Result<()> {
        self.check_mutable("unlink nodes")?;
        let (a, b) = self.pair_mut(src, dst)?;
        unlink_nodes(a.as_mut(), "src", b.as_mut(), "sink")
    }

    fn pair_mut(
        &mut self,
        a: &str,
        b: &str,
    ) -> Result<(&mut Box<dyn FlowNode>, &mut Box<dyn FlowNode>)> {
        let pipeline = self.core.name();
        let ia = self
            .nodes
            .iter()
            .position(|n| n.name() == a)
            .ok_or_else(|| FlowError::NotFound(format!("node '{a}' not found in '{pipeline}'")))?;
        let ib = self
            .nodes
            .iter()
            .position(|n| n.name() == b)
            .ok_or_else(|| FlowError::NotFound(format!("node '{b}' not found in '{pipeline}'")))?;
        if ia == ib {
            return Err(FlowError::Structure(format!(
                "cannot link node '{a}' to itself"
            )));
        }
        if ia < ib {
            let (left, right) = self.nodes.split_at_mut(ib);
            Ok((&mut left[ia], &mut right[0]))
        } else {
            let (left, right) = self.nodes.split_at_mut(ia);
            Ok((&mut right[0], &mut left[ib]))
        }
    }

    /// Attach an externally owned terminal sink to a member tee,
    /// assigning the lowest free sink id. Legal while Playing; the
    /// sink is started as part of the attach when the graph runs.
    pub fn attach_to_tee(&mut self, tee_name: &str, sink: &mut dyn TerminalNode) -> Result<u32> {
        if self.state == PipelineState::Error {
            return Err(FlowError::State(format!(
                "cannot attach while '{}' is {}",
                self.core.name(),
                self.state
            )));
        }
        let running = matches!(self.state, PipelineState::Playing | PipelineState::Paused);
        let tee = self.node_as_mut::<Tee>(tee_name)?;
        let used: BTreeSet<u32> = tee
            .granted_port_names()
            .iter()
            .filter_map(|n| parse_stream_id(n, "src_"))
            .collect();
        let mut id = 0;
        while used.contains(&id) {
            id += 1;
        }
        sink.set_sink_id(Some(id));
        if let Err(e) = attach_sink(sink, tee) {
            sink.set_sink_id(None);
            return Err(e);
        }
        if running {
            sink.start()?;
        }
        Ok(id)
    }

    /// Detach a terminal sink attached through `attach_to_tee`.
    pub fn detach_from_tee(&mut self, tee_name: &str, sink: &mut dyn TerminalNode) -> Result<()> {
        if self.state == PipelineState::Error {
            return Err(FlowError::State(format!(
                "cannot detach while '{}' is {}",
                self.core.name(),
                self.state
            )));
        }
        let running = matches!(self.state, PipelineState::Playing | PipelineState::Paused);
        let tee = self.node_as_mut::<Tee>(tee_name)?;
        detach_sink(sink, tee)?;
        if running {
            sink.stop()?;
        }
        Ok(())
    }

    fn transition(&mut self, new: PipelineState) {
        let old = self.state;
        self.state = new;
        info!(pipeline = %self.core.name(), %old, %new, "state changed");
        self.state_listeners.dispatch(&StateTransition { old, new });
    }

    /// Drive the graph to Playing, stepping through Ready and Paused.
    /// Each step completes before the next begins and is reported to
    /// the state listeners.
    pub fn play(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Error => {
                return Err(FlowError::State(format!(
                    "cannot play '{}' from the error state",
                    self.core.name()
                )));
            }
            PipelineState::Playing => return Ok(()),
            _ => {}
        }
        if self.state == PipelineState::Null {
            for node in &mut self.nodes {
                node.link_all()?;
            }
            self.transition(PipelineState::Ready);
        }
        if self.state == PipelineState::Ready {
            for node in self.nodes.iter_mut().rev() {
                if node.kind() != NodeKind::Source {
                    node.start()?;
                }
            }
            self.transition(PipelineState::Paused);
        }
        if self.state == PipelineState::Paused {
            for node in self.nodes.iter_mut().rev() {
                if node.kind() == NodeKind::Source {
                    node.start()?;
                }
            }
            self.transition(PipelineState::Playing);
        }
        Ok(())
    }

    /// Halt the sources, leave the rest of the graph running.
    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Paused => Ok(()),
            PipelineState::Playing => {
                for node in &mut self.nodes {
                    if node.kind() == NodeKind::Source {
                        node.stop()?;
                    }
                }
                self.transition(PipelineState::Paused);
                Ok(())
            }
            state => Err(FlowError::State(format!(
                "cannot pause '{}' from {state}",
                self.core.name()
            ))),
        }
    }

    /// Tear the graph down to Null. Also the recovery path out of the
    /// error state.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == PipelineState::Null {
            return Ok(());
        }
        if self.state == PipelineState::Error {
            self.halt_all();
            for node in &mut self.nodes {
                node.unlink_all()?;
            }
            self.transition(PipelineState::Null);
            return Ok(());
        }
        if self.state == PipelineState::Playing {
            for node in &mut self.nodes {
                if node.kind() == NodeKind::Source {
                    node.stop()?;
                }
            }
            self.transition(PipelineState::Paused);
        }
        if self.state == PipelineState::Paused {
            for node in &mut self.nodes {
                if node.kind() != NodeKind::Source {
                    node.stop()?;
                }
            }
            self.transition(PipelineState::Ready);
        }
        if self.state == PipelineState::Ready {
            for node in &mut self.nodes {
                node.unlink_all()?;
            }
            self.transition(PipelineState::Null);
        }
        Ok(())
    }

    fn halt_all(&mut self) {
        for node in &mut self.nodes {
            if let Err(e) = node.stop() {
                warn!(pipeline = %self.core.name(), node = %node.name(), error = %e, "stop failed");
            }
        }
    }

    /// Drain the bus: wait up to `wait` for the first message, then
    /// take whatever else is queued. Returns how many were handled.
    ///
    /// End-of-stream is reported to the EOS listeners. An error is
    /// reported to the error listeners and then halts the graph into
    /// the error state; `stop` clears it.
    pub fn process_bus(&mut self, wait: Duration) -> usize {
        let mut handled = 0;
        let Ok(first) = self.bus_rx.recv_timeout(wait) else {
            return handled;
        };
        let mut next = Some(first);
        while let Some(message) = next {
            handled += 1;
            self.handle_bus_message(message);
            next = self.bus_rx.try_recv().ok();
        }
        handled
    }

    fn handle_bus_message(&mut self, message: BusMessage) {
        match message {
            BusMessage::Eos { node } => {
                info!(pipeline = %self.core.name(), node = %node, "end of stream");
                self.eos_listeners.dispatch(&EosEvent { node });
            }
            BusMessage::Error { node, message } => {
                error!(
                    pipeline = %self.core.name(),
                    node = %node,
                    message = %message,
                    "node reported an error"
                );
                self.error_listeners.dispatch(&ErrorEvent { node, message });
                if self.state != PipelineState::Error && self.state != PipelineState::Null {
                    self.halt_all();
                    self.transition(PipelineState::Error);
                }
            }
        }
    }
}
