use crate::core::bin::Bin;
use crate::core::demux::Demuxer;
use crate::core::error::{FlowError, Result};
use crate::core::mux::Muxer;
use crate::core::node::{link_nodes, unlink_nodes, FlowNode, NodeCore, NodeKind};
use crate::core::port::{GrantedPort, LinkState, Port};
use crate::core::queue::Queue;
use std::any::Any;
use std::collections::BTreeMap;
use tracing::{debug, info};

struct Branch {
    bin: Bin,
    demux_grant: GrantedPort,
    mux_grant: GrantedPort,
}

/// Selects a subset of stream ids out of a mixed flow, runs each
/// selected stream through its own branch, and merges the branches
/// back into one flow.
///
/// The demuxer and muxer exist for the whole life of the remuxer;
/// branches come and go with [`add_stream`](Remuxer::add_stream) and
/// [`remove_stream`](Remuxer::remove_stream). A fresh branch is a
/// single buffering queue; fetch it with
/// [`branch_mut`](Remuxer::branch_mut) to insert processing stages
/// before linking.
pub struct Remuxer {
    core: NodeCore,
    max_streams: usize,
    demux: Demuxer,
    mux: Muxer,
    branches: BTreeMap<u32, Branch>,
    running: bool,
}

impl Remuxer {
    pub fn new(name: impl Into<String>, max_streams: usize) -> Result<Self> {
        let name = name.into();
        let core = NodeCore::new(&name, NodeKind::Remuxer)?;
        let mut demux = Demuxer::new(format!("{name}-demux"), max_streams)?;
        demux.core_mut().assign_parent(&name)?;
        let mut mux = Muxer::new(format!("{name}-mux"), max_streams)?;
        mux.core_mut().assign_parent(&name)?;
        Ok(Self {
            core,
            max_streams,
            demux,
            mux,
            branches: BTreeMap::new(),
            running: false,
        })
    }

    /// Select a stream id: grant lanes on both ends and wire a branch
    /// between them.
    pub fn add_stream(&mut self, stream_id: u32) -> Result<()> {
        if stream_id as usize >= self.max_streams {
            return Err(FlowError::Capacity(format!(
                "stream id {stream_id} out of range for '{}' (max {})",
                self.core.name(),
                self.max_streams
            )));
        }
        if self.branches.contains_key(&stream_id) {
            return Err(FlowError::Structure(format!(
                "stream {stream_id} is already selected on '{}'",
                self.core.name()
            )));
        }
        let demux_grant = self.demux.request_stream_port(stream_id)?;
        let mut bin = match self.build_branch(stream_id) {
            Ok(bin) => bin,
            Err(e) => {
                let _ = self.demux.release_stream_port(demux_grant);
                return Err(e);
            }
        };
        let mux_grant = match self.mux.request_stream_port(stream_id) {
            Ok(grant) => grant,
            Err(e) => {
                let _ = self.demux.release_stream_port(demux_grant);
                return Err(e);
            }
        };
        let wired = (|| -> Result<()> {
            link_nodes(
                &mut self.demux,
                demux_grant.port_name(),
                &mut bin,
                "sink",
            )?;
            link_nodes(&mut bin, "src", &mut self.mux, mux_grant.port_name())?;
            Ok(())
        })();
        if let Err(e) = wired {
            let _ = unlink_nodes(
                &mut self.demux,
                demux_grant.port_name(),
                &mut bin,
                "sink",
            );
            let _ = self.demux.release_stream_port(demux_grant);
            let _ = self.mux.release_stream_port(mux_grant);
            return Err(e);
        }
        if self.running {
            bin.link_all()?;
            bin.start()?;
        }
        info!(remuxer = %self.core.name(), stream = stream_id, branch = %bin.name(), "stream selected");
        self.branches.insert(
            stream_id,
            Branch {
                bin,
                demux_grant,
                mux_grant,
            },
        );
        Ok(())
    }

    /// Deselect a stream id: tear the branch down and hand both lane
    /// grants back.
    pub fn remove_stream(&mut self, stream_id: u32) -> Result<()> {
        let Some(mut branch) = self.branches.remove(&stream_id) else {
            return Err(FlowError::NotFound(format!(
                "stream {stream_id} is not selected on '{}'",
                self.core.name()
            )));
        };
        if self.running {
            branch.bin.stop()?;
        }
        unlink_nodes(
            &mut self.demux,
            branch.demux_grant.port_name(),
            &mut branch.bin,
            "sink",
        )?;
        unlink_nodes(
            &mut branch.bin,
            "src",
            &mut self.mux,
            branch.mux_grant.port_name(),
        )?;
        if branch.bin.is_linked() {
            branch.bin.unlink_all()?;
        }
        self.demux.release_stream_port(branch.demux_grant)?;
        self.mux.release_stream_port(branch.mux_grant)?;
        info!(remuxer = %self.core.name(), stream = stream_id, "stream deselected");
        Ok(())
    }

    pub fn selected_streams(&self) -> Vec<u32> {
        self.branches.keys().copied().collect()
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    pub fn branch(&self, stream_id: u32) -> Option<&Bin> {
        self.branches.get(&stream_id).map(|b| &b.bin)
    }

    pub fn branch_mut(&mut self, stream_id: u32) -> Option<&mut Bin> {
        self.branches.get_mut(&stream_id).map(|b| &mut b.bin)
    }

    fn build_branch(&mut self, stream_id: u32) -> Result<Bin> {
        let branch_name = format!("{}-branch-{stream_id}", self.core.name());
        let queue_name = format!("{branch_name}-queue");
        let mut bin = Bin::new(&branch_name)?;
        bin.core_mut().assign_parent(self.core.name())?;
        bin.add_child(Box::new(Queue::new(&queue_name)?))?;
        bin.add_ghost_port("sink", &queue_name, "sink")?;
        bin.add_ghost_port("src", &queue_name, "src")?;
        Ok(bin)
    }
}

impl FlowNode for Remuxer {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn link_state(&self) -> LinkState {
        let upstream = self
            .demux
            .core()
            .port("sink")
            .is_some_and(|p| p.is_linked());
        let downstream = self.mux.core().port("src").is_some_and(|p| p.is_linked());
        match (upstream, downstream) {
            (false, false) => LinkState::Unlinked,
            (true, false) => LinkState::LinkedToSource,
            (false, true) => LinkState::LinkedToSink,
            (true, true) => LinkState::FullyLinked,
        }
    }

    fn boundary_port(&self, name: &str) -> Result<&Port> {
        match name {
            "sink" => self.demux.boundary_port("sink"),
            "src" => self.mux.boundary_port("src"),
            _ => Err(FlowError::NotFound(format!(
                "port '{name}' not found on '{}'",
                self.core.name()
            ))),
        }
    }

    fn boundary_port_mut(&mut self, name: &str) -> Result<&mut Port> {
        match name {
            "sink" => self.demux.boundary_port_mut("sink"),
            "src" => self.mux.boundary_port_mut("src"),
            _ => Err(FlowError::NotFound(format!(
                "port '{name}' not found on '{}'",
                self.core.name()
            ))),
        }
    }

    fn link_all(&mut self) -> Result<()> {
        let name = self.core.name().to_string();
        for (id, branch) in self.branches.iter_mut() {
            if branch.bin.is_linked() {
                continue;
            }
            branch.bin.link_all().map_err(|e| {
                FlowError::Structure(format!("'{name}' failed linking branch {id}: {e}"))
            })?;
        }
        Ok(())
    }

    fn unlink_all(&mut self) -> Result<()> {
        for (id, branch) in self.branches.iter_mut().rev() {
            if !branch.bin.is_linked() {
                debug!(remuxer = %self.core.name(), stream = id, "branch already unlinked");
                continue;
            }
            branch.bin.unlink_all()?;
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.mux.start()?;
        for branch in self.branches.values_mut().rev() {
            branch.bin.start()?;
        }
        self.demux.start()?;
        self.running = true;
        info!(remuxer = %self.core.name(), streams = self.branches.len(), "remuxer started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.demux.stop()?;
        for branch in self.branches.values_mut() {
            branch.bin.stop()?;
        }
        self.mux.stop()?;
        self.running = false;
        info!(remuxer = %self.core.name(), "remuxer stopped");
        Ok(())
    }

    fn rewire(&mut self) {
        self.demux.rewire();
        self.mux.rewire();
        for branch in self.branches.values_mut() {
            branch.bin.rewire();
        }
    }

    fn attach_bus(&mut self, bus: &crate::core::pipeline::BusSender) {
        self.demux.attach_bus(bus);
        self.mux.attach_bus(bus);
        for branch in self.branches.values_mut() {
            branch.bin.attach_bus(bus);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
