use crate::core::error::{FlowError, Result};
use crate::core::frame::Frame;
use crate::core::node::{FlowNode, NodeCore, NodeKind};
use crate::core::port::{GrantedPort, Port, PortRole};
use crate::core::worker::{Worker, POLL_INTERVAL};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct DemuxShared {
    rx: Option<Receiver<Frame>>,
    routes: BTreeMap<u32, Sender<Frame>>,
}

/// Splits a mixed flow into per-stream lanes.
///
/// A granted port `src_{id}` carries exactly the frames tagged with
/// stream id `id`; frames for ids without a linked lane are dropped and
/// counted. Tags are preserved on the way through.
pub struct Demuxer {
    core: NodeCore,
    max_streams: usize,
    grants: BTreeMap<u32, u64>,
    next_serial: u64,
    shared: Arc<Mutex<DemuxShared>>,
    unrouted: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    worker: Option<Worker>,
}

impl Demuxer {
    pub fn new(name: impl Into<String>, max_streams: usize) -> Result<Self> {
        let mut core = NodeCore::new(name, NodeKind::Demuxer)?;
        core.add_port(Port::new_static("sink", PortRole::Sink))?;
        Ok(Self {
            core,
            max_streams,
            grants: BTreeMap::new(),
            next_serial: 1,
            shared: Arc::new(Mutex::new(DemuxShared::default())),
            unrouted: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            worker: None,
        })
    }

    /// Grant the on-demand port `src_{stream_id}` bound to that stream.
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
        let port_name = format!("src_{stream_id}");
        self.core
            .add_port(Port::new_on_demand(&port_name, PortRole::Source))?;
        let serial = self.next_serial;
        self.next_serial += 1;
        self.grants.insert(stream_id, serial);
        debug!(demuxer = %self.core.name(), stream = stream_id, serial, "granted stream port");
        Ok(GrantedPort::new(self.core.name(), port_name, serial))
    }

    /// Release a stream grant with the exact token handed out.
    pub fn release_stream_port(&mut self, granted: GrantedPort) -> Result<()> {
        if granted.node() != self.core.name() {
            return Err(FlowError::Structure(format!(
                "grant for '{}' was not issued by '{}'",
                granted.address(),
                self.core.name()
            )));
        }
        let stream_id = parse_stream_id(granted.port_name(), "src_").ok_or_else(|| {
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
        debug!(demuxer = %self.core.name(), stream = stream_id, "released stream port");
        Ok(())
    }

    pub fn granted_streams(&self) -> Vec<u32> {
        self.grants.keys().copied().collect()
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    /// Frames that arrived for a stream with no linked lane.
    pub fn unrouted(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FlowNode for Demuxer {
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
        let unrouted = self.unrouted.clone();
        let dropped = self.dropped.clone();
        self.worker = Some(Worker::spawn(self.core.name(), move |shutdown| {
            loop {
                if shutdown.try_recv().is_ok() {
                    break;
                }
                let rx = shared.lock().rx.clone();
                let Some(rx) = rx else {
                    match shutdown.recv_timeout(POLL_INTERVAL) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => continue,
                    }
                };
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(frame) => {
                        let route = shared.lock().routes.get(&frame.stream_id).cloned();
                        match route {
                            Some(lane) => {
                                if lane.try_send(frame).is_err() {
                                    dropped.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            None => {
                                unrouted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        let mut s = shared.lock();
                        if s.rx.as_ref().is_some_and(|cur| cur.same_channel(&rx)) {
                            s.rx = None;
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
            debug!(
                demuxer = %self.core.name(),
                unrouted = self.unrouted(),
                dropped = self.dropped(),
                "demuxer stopped"
            );
        }
        Ok(())
    }

    fn rewire(&mut self) {
        let mut shared = self.shared.lock();
        shared.rx = self.core.port("sink").and_then(|p| p.receiver());
        shared.routes = self
            .grants
            .keys()
            .filter_map(|id| {
                self.core
                    .port(&format!("src_{id}"))
                    .and_then(|p| p.sender())
                    .map(|tx| (*id, tx))
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

pub(crate) fn parse_stream_id(port_name: &str, prefix: &str) -> Option<u32> {
    port_name.strip_prefix(prefix)?.parse().ok()
}
