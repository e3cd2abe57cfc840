use crate::core::demux::parse_stream_id;
use crate::core::error::{FlowError, Result};
use crate::core::frame::Frame;
use crate::core::node::{FlowNode, NodeCore, NodeKind};
use crate::core::port::{GrantedPort, Port, PortRole};
use crate::core::worker::{Worker, POLL_INTERVAL};
use crossbeam_channel::{Receiver, RecvTimeoutError, Select, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct MuxShared {
    tx: Option<Sender<Frame>>,
    lanes: BTreeMap<u32, Receiver<Frame>>,
}

/// Merges per-stream lanes back into one flow.
///
/// A granted port `sink_{id}` accepts one lane; every frame leaving the
/// muxer carries the id of the lane it arrived on, whatever tag it had
/// before. Lanes are drained as frames become ready, with no ordering
/// promise across lanes.
pub struct Muxer {
    core: NodeCore,
    max_streams: usize,
    grants: BTreeMap<u32, u64>,
    next_serial: u64,
    shared: Arc<Mutex<MuxShared>>,
    dropped: Arc<AtomicU64>,
    worker: Option<Worker>,
}

impl Muxer {
    pub fn new(name: impl Into<String>, max_streams: usize) -> Result<Self> {
        let mut core = NodeCore::new(name, NodeKind::Muxer)?;
        core.add_port(Port::new_static("src", PortRole::Source))?;
        Ok(Self {
            core,
            max_streams,
            grants: BTreeMap::new(),
            next_serial: 1,
            shared: Arc::new(Mutex::new(MuxShared::default())),
            dropped: Arc::new(AtomicU64::new(0)),
            worker: None,
        })
    }

    /// Grant the on-demand port `sink_{stream_id}`; frames from it are
    /// re-tagged with `stream_id` on the way out.
    pub fn request_stream_port(&mut self, stream_id: u32) -> Result<GrantedPort> {
        if stream_id as usize >= self.max_streams {
            return Err(FlowError::Capacity(format!(
                "stream id {stream_id} out of range for '{}' (max {})",
                self.core.name(),
                self.max_streams
            )));
        }
        if self.grants.contains_key(&stream_id) {
            return Err(FlowError::Structure(format!(
                "'{}' already has an outstanding grant for stream {stream_id}",
                self.core.name()
            )));
        }
        let port_name = format!("sink_{stream_id}");
        self.core
            .add_port(Port::new_on_demand(&port_name, PortRole::Sink))?;
        let serial = self.next_serial;
        self.next_serial += 1;
        self.grants.insert(stream_id, serial);
        debug!(muxer = %self.core.name(), stream = stream_id, serial, "granted stream port");
        Ok(GrantedPort::new(self.core.name(), port_name, serial))
    }

    pub fn release_stream_port(&mut self, granted: GrantedPort) -> Result<()> {
        if granted.node() != self.core.name() {
            return Err(FlowError::Structure(format!(
                "grant for '{}' was not issued by '{}'",
                granted.address(),
                self.core.name()
            )));
        }
        let stream_id = parse_stream_id(granted.port_name(), "sink_").ok_or_else(|| {
            FlowError::Structure(format!(
                "'{}' is not a stream port of '{}'",
                granted.port_name(),
                self.core.name()
            ))
        })?;
        match self.grants.get(&stream_id) {
            None => {
                return Err(FlowError::Structure(format!(
                    "'{}' has no outstanding grant for stream {stream_id}",
                    self.core.name()
                )));
            }
            Some(serial) if *serial != granted.serial() => {
                return Err(FlowError::Structure(format!(
                    "stale grant for stream {stream_id} on '{}'",
                    self.core.name()
                )));
            }
            Some(_) => {}
        }
        self.core.remove_port(granted.port_name())?;
        self.grants.remove(&stream_id);
        self.rewire();
        debug!(muxer = %self.core.name(), stream = stream_id, "released stream port");
        Ok(())
    }

    pub fn granted_streams(&self) -> Vec<u32> {
        self.grants.keys().copied().collect()
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FlowNode for Muxer {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.rewire();
        let shared = self.shared.clone();
        let dropped = self.dropped.clone();
        self.worker = Some(Worker::spawn(self.core.name(), move |shutdown| {
            loop {
                if shutdown.try_recv().is_ok() {
                    break;
                }
                let (tx, lanes) = {
                    let s = shared.lock();
                    let lanes: Vec<(u32, Receiver<Frame>)> =
                        s.lanes.iter().map(|(id, rx)| (*id, rx.clone())).collect();
                    (s.tx.clone(), lanes)
                };
                let Some(tx) = tx else {
                    match shutdown.recv_timeout(POLL_INTERVAL) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => continue,
                    }
                };
                if lanes.is_empty() {
                    match shutdown.recv_timeout(POLL_INTERVAL) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => continue,
                    }
                }
                let mut sel = Select::new();
                sel.recv(&shutdown);
                for (_, rx) in &lanes {
                    sel.recv(rx);
                }
                let Ok(oper) = sel.select_timeout(POLL_INTERVAL) else {
                    continue;
                };
                let index = oper.index();
                if index == 0 {
                    let _ = oper.recv(&shutdown);
                    break;
                }
                let (stream_id, rx) = &lanes[index - 1];
                match oper.recv(rx) {
                    Ok(mut frame) => {
                        frame.stream_id = *stream_id;
                        if tx.try_send(frame).is_err() {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(_) => {
                        // Upstream went away; forget the lane so the
                        // select does not spin on it.
                        let mut s = shared.lock();
                        if s.lanes
                            .get(stream_id)
                            .is_some_and(|cur| cur.same_channel(rx))
                        {
                            s.lanes.remove(stream_id);
                        }
                    }
                }
            }
        })?);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            debug!(muxer = %self.core.name(), dropped = self.dropped(), "muxer stopped");
        }
        Ok(())
    }

    fn rewire(&mut self) {
        let mut shared = self.shared.lock();
        shared.tx = self.core.port("src").and_then(|p| p.sender());
        shared.lanes = self
            .grants
            .keys()
            .filter_map(|id| {
                self.core
                    .port(&format!("sink_{id}"))
                    .and_then(|p| p.receiver())
                    .map(|rx| (*id, rx))
            })
            .collect();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
