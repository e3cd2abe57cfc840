use crate::core::error::{FlowError, Result};
use crate::core::frame::Frame;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default bounded-channel capacity for a link.
pub const DEFAULT_LINK_CAPACITY: usize = 8;

/// Direction of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortRole {
    /// Emits frames downstream.
    Source,
    /// Receives frames from upstream.
    Sink,
}

impl std::fmt::Display for PortRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Sink => write!(f, "sink"),
        }
    }
}

/// How a port comes into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    /// Present for the node's whole lifetime.
    Static,
    /// Created by an explicit request and destroyed by a matching release.
    OnDemand,
}

/// Link summary for a node, derived from its ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    #[default]
    Unlinked,
    /// Upstream side connected only.
    LinkedToSource,
    /// Downstream side connected only.
    LinkedToSink,
    FullyLinked,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlinked => write!(f, "Unlinked"),
            Self::LinkedToSource => write!(f, "LinkedToSource"),
            Self::LinkedToSink => write!(f, "LinkedToSink"),
            Self::FullyLinked => write!(f, "FullyLinked"),
        }
    }
}

/// Address of a port in "node.port" form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortAddress {
    pub node: String,
    pub port: String,
}

impl PortAddress {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }

    /// Parse a "node.port" address.
    pub fn parse(address: &str) -> Result<Self> {
        match address.split_once('.') {
            Some((node, port)) if !node.is_empty() && !port.is_empty() => {
                Ok(Self::new(node, port))
            }
            _ => Err(FlowError::Configuration(format!(
                "invalid port address '{address}', expected 'node.port'"
            ))),
        }
    }
}

impl std::fmt::Display for PortAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// Proof that an on-demand port was handed out by its owner.
///
/// Release requires the exact token issued at request time; a stale token
/// (from an earlier grant of the same port name) or a token minted for a
/// different owner is rejected.
#[derive(Debug, PartialEq, Eq)]
pub struct GrantedPort {
    node: String,
    port: String,
    serial: u64,
}

impl GrantedPort {
    pub(crate) fn new(node: impl Into<String>, port: impl Into<String>, serial: u64) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
            serial,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn port_name(&self) -> &str {
        &self.port
    }

    pub fn address(&self) -> PortAddress {
        PortAddress::new(&self.node, &self.port)
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }
}

/// A connection point on a node.
///
/// A linked source port holds the sending half of the link's bounded
/// channel, a linked sink port the receiving half. Peers are recorded by
/// address, never by reference, so the graph stays free of ownership
/// cycles.
#[derive(Debug)]
pub struct Port {
    name: String,
    role: PortRole,
    kind: PortKind,
    peer: Option<PortAddress>,
    tx: Option<Sender<Frame>>,
    rx: Option<Receiver<Frame>>,
}

impl Port {
    pub fn new_static(name: impl Into<String>, role: PortRole) -> Self {
        Self::new(name, role, PortKind::Static)
    }

    pub fn new_on_demand(name: impl Into<String>, role: PortRole) -> Self {
        Self::new(name, role, PortKind::OnDemand)
    }

    fn new(name: impl Into<String>, role: PortRole, kind: PortKind) -> Self {
        Self {
            name: name.into(),
            role,
            kind,
            peer: None,
            tx: None,
            rx: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> PortRole {
        self.role
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    pub fn is_linked(&self) -> bool {
        self.peer.is_some()
    }

    pub fn peer(&self) -> Option<&PortAddress> {
        self.peer.as_ref()
    }

    pub(crate) fn sender(&self) -> Option<Sender<Frame>> {
        self.tx.clone()
    }

    pub(crate) fn receiver(&self) -> Option<Receiver<Frame>> {
        self.rx.clone()
    }
}

/// Link a source port to a sink port over a fresh bounded channel.
///
/// Fails with a structural error if either port is already linked; there
/// is no implicit unlink.
pub fn link_ports(
    src_node: &str,
    src: &mut Port,
    dst_node: &str,
    dst: &mut Port,
    capacity: usize,
) -> Result<()> {
    if src.role != PortRole::Source {
        return Err(FlowError::Structure(format!(
            "port '{}.{}' is a {} port, cannot link from it",
            src_node, src.name, src.role
        )));
    }
    if dst.role != PortRole::Sink {
        return Err(FlowError::Structure(format!(
            "port '{}.{}' is a {} port, cannot link into it",
            dst_node, dst.name, dst.role
        )));
    }
    if let Some(peer) = &src.peer {
        return Err(FlowError::Structure(format!(
            "port '{}.{}' is already linked to '{}'",
            src_node, src.name, peer
        )));
    }
    if let Some(peer) = &dst.peer {
        return Err(FlowError::Structure(format!(
            "port '{}.{}' is already linked to '{}'",
            dst_node, dst.name, peer
        )));
    }

    let (tx, rx) = bounded(capacity);
    src.tx = Some(tx);
    dst.rx = Some(rx);
    src.peer = Some(PortAddress::new(dst_node, &dst.name));
    dst.peer = Some(PortAddress::new(src_node, &src.name));
    debug!(
        src = %format_args!("{src_node}.{}", src.name),
        dst = %format_args!("{dst_node}.{}", dst.name),
        capacity,
        "linked ports"
    );
    Ok(())
}

/// Unlink a pair of ports previously joined by [`link_ports`].
///
/// Both ports return to the unconnected state; the channel between them is
/// dropped. Fails if the two ports are not linked to each other.
pub fn unlink_ports(src_node: &str, src: &mut Port, dst_node: &str, dst: &mut Port) -> Result<()> {
    let expected = PortAddress::new(dst_node, &dst.name);
    match &src.peer {
        Some(peer) if *peer == expected => {}
        Some(peer) => {
            return Err(FlowError::Structure(format!(
                "port '{}.{}' is linked to '{}', not to '{}'",
                src_node, src.name, peer, expected
            )));
        }
        None => {
            return Err(FlowError::Structure(format!(
                "port '{}.{}' is not linked",
                src_node, src.name
            )));
        }
    }

    src.tx = None;
    src.peer = None;
    dst.rx = None;
    dst.peer = None;
    debug!(
        src = %format_args!("{src_node}.{}", src.name),
        dst = %format_args!("{dst_node}.{}", dst.name),
        "unlinked ports"
    );
    Ok(())
}
