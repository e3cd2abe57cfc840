use crate::core::display::RgbaColor;
use crate::core::error::{FlowError, Result};
use crate::core::frame::Frame;
use crate::core::node::{FlowNode, NodeCore, NodeKind};
use crate::core::port::{
    link_ports, unlink_ports, GrantedPort, Port, PortRole, DEFAULT_LINK_CAPACITY,
};
use crate::core::queue::Queue;
use crate::core::tee::Tee;
use crate::core::worker::{Worker, POLL_INTERVAL};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A leaf output stage that can be attached to a fan-out point.
///
/// Attachment is keyed by the sink id: the requested tee port is always
/// named `src_{id}`, and detaching releases the exact grant recorded at
/// attach time.
pub trait TerminalNode: FlowNode {
    fn sink_id(&self) -> Option<u32>;
    fn set_sink_id(&mut self, id: Option<u32>);

    fn granted(&self) -> Option<&GrantedPort>;
    fn take_granted(&mut self) -> Option<GrantedPort>;
    fn store_granted(&mut self, granted: GrantedPort);

    fn is_attached(&self) -> bool {
        self.granted().is_some()
    }
}

/// Attach a sink to a tee: request `src_{id}`, link it to the sink's
/// boundary, record the grant. A failed link releases the grant again.
pub fn attach_sink(sink: &mut dyn TerminalNode, tee: &mut Tee) -> Result<()> {
    let id = sink.sink_id().ok_or_else(|| {
        FlowError::State(format!("sink '{}' has no sink id assigned", sink.name()))
    })?;
    if sink.is_attached() {
        return Err(FlowError::Structure(format!(
            "sink '{}' is already attached",
            sink.name()
        )));
    }
    let tee_name = tee.name().to_string();
    let sink_name = sink.name().to_string();
    let port_name = format!("src_{id}");
    let granted = tee.request_src_port(&port_name)?;

    let linked = (|| -> Result<()> {
        let sp = tee.boundary_port_mut(&port_name)?;
        let dp = sink.boundary_port_mut("sink")?;
        link_ports(&tee_name, sp, &sink_name, dp, DEFAULT_LINK_CAPACITY)
    })();
    if let Err(e) = linked {
        let _ = tee.release_src_port(granted);
        return Err(e);
    }
    tee.rewire();
    sink.rewire();
    sink.store_granted(granted);
    info!(sink = %sink_name, tee = %tee_name, port = %port_name, "sink attached");
    Ok(())
}

/// Detach a sink from a tee: unlink first, then release the stored grant
/// and clear the sink id. Detaching an unattached sink is an error.
pub fn detach_sink(sink: &mut dyn TerminalNode, tee: &mut Tee) -> Result<()> {
    let granted = sink.take_granted().ok_or_else(|| {
        FlowError::Structure(format!("sink '{}' is not attached", sink.name()))
    })?;
    let tee_name = tee.name().to_string();
    let sink_name = sink.name().to_string();

    let unlinked = (|| -> Result<()> {
        let sp = tee.boundary_port_mut(granted.port_name())?;
        let dp = sink.boundary_port_mut("sink")?;
        unlink_ports(&tee_name, sp, &sink_name, dp)
    })();
    if let Err(e) = unlinked {
        sink.store_granted(granted);
        return Err(e);
    }
    tee.rewire();
    sink.rewire();
    let port_name = granted.port_name().to_string();
    tee.release_src_port(granted)?;
    sink.set_sink_id(None);
    info!(sink = %sink_name, tee = %tee_name, port = %port_name, "sink detached");
    Ok(())
}

pub(crate) fn link_queue_to_drain(node: &str, queue: &mut Queue, core: &mut NodeCore) -> Result<()> {
    if core.require_port("drain")?.is_linked() {
        return Ok(());
    }
    let queue_name = queue.name().to_string();
    let sp = queue.core_mut().require_port_mut("src")?;
    let dp = core.require_port_mut("drain")?;
    link_ports(&queue_name, sp, node, dp, DEFAULT_LINK_CAPACITY)?;
    queue.rewire();
    Ok(())
}

pub(crate) fn unlink_queue_from_drain(
    node: &str,
    queue: &mut Queue,
    core: &mut NodeCore,
) -> Result<()> {
    if !core.require_port("drain")?.is_linked() {
        return Ok(());
    }
    let queue_name = queue.name().to_string();
    let sp = queue.core_mut().require_port_mut("src")?;
    let dp = core.require_port_mut("drain")?;
    unlink_ports(&queue_name, sp, node, dp)?;
    queue.rewire();
    Ok(())
}

/// Counting sink for tests and dry runs. Consumes and discards frames.
pub struct FakeSink {
    core: NodeCore,
    queue: Queue,
    sink_id: Option<u32>,
    granted: Option<GrantedPort>,
    received: Arc<AtomicU64>,
    worker: Option<Worker>,
}

impl FakeSink {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let mut core = NodeCore::new(&name, NodeKind::Sink)?;
        core.add_port(Port::new_static("drain", PortRole::Sink))?;
        let queue = Queue::new(format!("{name}-queue"))?;
        Ok(Self {
            core,
            queue,
            sink_id: None,
            granted: None,
            received: Arc::new(AtomicU64::new(0)),
            worker: None,
        })
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl FlowNode for FakeSink {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn boundary_port(&self, name: &str) -> Result<&Port> {
        if name == "sink" {
            return self.queue.core().require_port("sink");
        }
        self.core.require_port(name)
    }

    fn boundary_port_mut(&mut self, name: &str) -> Result<&mut Port> {
        if name == "sink" {
            return self.queue.core_mut().require_port_mut("sink");
        }
        self.core.require_port_mut(name)
    }

    fn link_all(&mut self) -> Result<()> {
        let name = self.core.name().to_string();
        link_queue_to_drain(&name, &mut self.queue, &mut self.core)?;
        self.rewire();
        Ok(())
    }

    fn unlink_all(&mut self) -> Result<()> {
        let name = self.core.name().to_string();
        unlink_queue_from_drain(&name, &mut self.queue, &mut self.core)?;
        self.rewire();
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.link_all()?;
        self.queue.start()?;
        let rx = self.core.port("drain").and_then(|p| p.receiver());
        let received = self.received.clone();
        self.worker = Some(Worker::spawn(self.core.name(), move |shutdown| {
            drain_loop(rx, shutdown, move |_frame| {
                received.fetch_add(1, Ordering::Relaxed);
            });
        })?);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self.queue.stop()?;
        debug!(sink = %self.core.name(), received = self.received(), "fake sink stopped");
        Ok(())
    }

    fn rewire(&mut self) {
        self.queue.rewire();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl TerminalNode for FakeSink {
    fn sink_id(&self) -> Option<u32> {
        self.sink_id
    }

    fn set_sink_id(&mut self, id: Option<u32>) {
        self.sink_id = id;
    }

    fn granted(&self) -> Option<&GrantedPort> {
        self.granted.as_ref()
    }

    fn take_granted(&mut self) -> Option<GrantedPort> {
        self.granted.take()
    }

    fn store_granted(&mut self, granted: GrantedPort) {
        self.granted = Some(granted);
    }
}

/// On-screen overlay stage with an enable toggle.
///
/// When disabled it keeps draining its lane without rendering, so an
/// upstream tee never sees the lane back up. The indicator color is what
/// a recording badge would be tinted with.
pub struct OverlaySink {
    core: NodeCore,
    queue: Queue,
    sink_id: Option<u32>,
    granted: Option<GrantedPort>,
    offset_x: u32,
    offset_y: u32,
    width: u32,
    height: u32,
    indicator: RgbaColor,
    enabled: Arc<AtomicBool>,
    rendered: Arc<AtomicU64>,
    worker: Option<Worker>,
}

impl OverlaySink {
    pub fn new(
        name: impl Into<String>,
        offset_x: u32,
        offset_y: u32,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let name = name.into();
        let mut core = NodeCore::new(&name, NodeKind::Sink)?;
        core.add_port(Port::new_static("drain", PortRole::Sink))?;
        let queue = Queue::new(format!("{name}-queue"))?;
        Ok(Self {
            core,
            queue,
            sink_id: None,
            granted: None,
            offset_x,
            offset_y,
            width,
            height,
            indicator: RgbaColor::new(1.0, 0.0, 0.0, 1.0),
            enabled: Arc::new(AtomicBool::new(true)),
            rendered: Arc::new(AtomicU64::new(0)),
            worker: None,
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        debug!(sink = %self.core.name(), enabled, "overlay toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    pub fn offsets(&self) -> (u32, u32) {
        (self.offset_x, self.offset_y)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn set_offsets(&mut self, x: u32, y: u32) {
        self.offset_x = x;
        self.offset_y = y;
    }

    pub fn indicator_color(&self) -> RgbaColor {
        self.indicator
    }

    pub fn set_indicator_color(&mut self, color: RgbaColor) {
        self.indicator = color;
    }
}

impl FlowNode for OverlaySink {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn boundary_port(&self, name: &str) -> Result<&Port> {
        if name == "sink" {
            return self.queue.core().require_port("sink");
        }
        self.core.require_port(name)
    }

    fn boundary_port_mut(&mut self, name: &str) -> Result<&mut Port> {
        if name == "sink" {
            return self.queue.core_mut().require_port_mut("sink");
        }
        self.core.require_port_mut(name)
    }

    fn link_all(&mut self) -> Result<()> {
        let name = self.core.name().to_string();
        link_queue_to_drain(&name, &mut self.queue, &mut self.core)?;
        self.rewire();
        Ok(())
    }

    fn unlink_all(&mut self) -> Result<()> {
        let name = self.core.name().to_string();
        unlink_queue_from_drain(&name, &mut self.queue, &mut self.core)?;
        self.rewire();
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.link_all()?;
        self.queue.start()?;
        let rx = self.core.port("drain").and_then(|p| p.receiver());
        let enabled = self.enabled.clone();
        let rendered = self.rendered.clone();
        self.worker = Some(Worker::spawn(self.core.name(), move |shutdown| {
            drain_loop(rx, shutdown, move |_frame| {
                if enabled.load(Ordering::Relaxed) {
                    rendered.fetch_add(1, Ordering::Relaxed);
                }
            });
        })?);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self.queue.stop()?;
        debug!(sink = %self.core.name(), rendered = self.rendered(), "overlay sink stopped");
        Ok(())
    }

    fn rewire(&mut self) {
        self.queue.rewire();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl TerminalNode for OverlaySink {
    fn sink_id(&self) -> Option<u32> {
        self.sink_id
    }

    fn set_sink_id(&mut self, id: Option<u32>) {
        self.sink_id = id;
    }

    fn granted(&self) -> Option<&GrantedPort> {
        self.granted.as_ref()
    }

    fn take_granted(&mut self) -> Option<GrantedPort> {
        self.granted.take()
    }

    fn store_granted(&mut self, granted: GrantedPort) {
        self.granted = Some(granted);
    }
}

/// Shared drain-port loop for terminal workers.
pub(crate) fn drain_loop<F>(
    rx: Option<Receiver<Frame>>,
    shutdown: Receiver<()>,
    mut on_frame: F,
) where
    F: FnMut(Frame),
{
    let Some(rx) = rx else {
        // Not internally linked; nothing will ever arrive.
        let _ = shutdown.recv();
        return;
    };
    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => on_frame(frame),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                match shutdown.recv_timeout(POLL_INTERVAL) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }
}
