// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Smart-record sink: a terminal stage that keeps a rolling pre-event
//! cache and, on request, writes a clamped window of history plus live
//! frames to a container file.

use crate::core::cache::FrameCache;
use crate::core::error::{FlowError, Result};
use crate::core::events::ListenerSet;
use crate::core::frame::Frame;
use crate::core::node::{FlowNode, NodeCore, NodeKind};
use crate::core::pipeline::{BusMessage, BusSender};
use crate::core::port::{GrantedPort, Port, PortRole};
use crate::core::queue::Queue;
use crate::core::session::{
    clamp_session, ContainerKind, RecordingEvent, RecordingInfo, SessionMachine, SessionState,
    DEFAULT_CACHE_WINDOW, DEFAULT_MAX_SESSION,
};
use crate::core::sink::{drain_loop, TerminalNode};
use crate::core::worker::Worker;
use parking_lot::Mutex;
use std::any::Any;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where recorded frames end up. The engine hands over timing and
/// naming; the writer owns the binary layout.
pub trait ContainerWriter: Send {
    fn open(&mut self, path: &Path, width: u32, height: u32) -> Result<()>;
    fn write(&mut self, frame: &Frame) -> Result<()>;
    fn finalize(&mut self) -> Result<()>;
}

const DUMP_MAGIC: &[u8; 4] = b"FLR1";

/// Length-delimited frame dump, little-endian fields. Stands in for a
/// real av muxer; `read_dump` parses it back.
pub struct RawDumpWriter {
    out: Option<BufWriter<File>>,
}

impl RawDumpWriter {
    pub fn new() -> Self {
        Self { out: None }
    }
}

impl Default for RawDumpWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerWriter for RawDumpWriter {
    fn open(&mut self, path: &Path, width: u32, height: u32) -> Result<()> {
        if self.out.is_some() {
            return Err(FlowError::State(
                "dump writer already has an open output".into(),
            ));
        }
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(DUMP_MAGIC)?;
        out.write_all(&width.to_le_bytes())?;
        out.write_all(&height.to_le_bytes())?;
        self.out = Some(out);
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| FlowError::State("dump writer has no open output".into()))?;
        out.write_all(&frame.stream_id.to_le_bytes())?;
        out.write_all(&(frame.pts.as_nanos() as u64).to_le_bytes())?;
        out.write_all(&(frame.duration.as_nanos() as u64).to_le_bytes())?;
        out.write_all(&[u8::from(frame.keyframe)])?;
        out.write_all(&(frame.payload.len() as u32).to_le_bytes())?;
        out.write_all(&frame.payload)?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let mut out = self
            .out
            .take()
            .ok_or_else(|| FlowError::State("dump writer has no open output".into()))?;
        out.flush()?;
        Ok(())
    }
}

/// Parse a raw dump back into `(width, height, frames)`.
pub fn read_dump(path: &Path) -> Result<(u32, u32, Vec<Frame>)> {
    let mut input = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if &magic != DUMP_MAGIC {
        return Err(FlowError::Configuration(format!(
            "'{}' is not a frame dump",
            path.display()
        )));
    }
    let mut u32buf = [0u8; 4];
    let mut u64buf = [0u8; 8];
    input.read_exact(&mut u32buf)?;
    let width = u32::from_le_bytes(u32buf);
    input.read_exact(&mut u32buf)?;
    let height = u32::from_le_bytes(u32buf);

    let mut frames = Vec::new();
    loop {
        match input.read_exact(&mut u32buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let stream_id = u32::from_le_bytes(u32buf);
        input.read_exact(&mut u64buf)?;
        let pts = Duration::from_nanos(u64::from_le_bytes(u64buf));
        input.read_exact(&mut u64buf)?;
        let duration = Duration::from_nanos(u64::from_le_bytes(u64buf));
        let mut flag = [0u8; 1];
        input.read_exact(&mut flag)?;
        input.read_exact(&mut u32buf)?;
        let len = u32::from_le_bytes(u32buf) as usize;
        let mut payload = vec![0u8; len];
        input.read_exact(&mut payload)?;
        frames.push(
            Frame::new(stream_id, pts, payload.into()).with_timing(duration, flag[0] != 0),
        );
    }
    Ok((width, height, frames))
}

struct RecordShared {
    machine: SessionMachine,
    cache: FrameCache,
    writer: Box<dyn ContainerWriter>,
    path: PathBuf,
    live_end: Duration,
    written: u64,
}

/// Terminal recording stage.
///
/// While idle every arriving frame lands in the cache. `start_session`
/// clamps the requested window, replays the cached history into a fresh
/// output file, and keeps writing live frames until the window is
/// covered or `stop_session` truncates it. Listeners get a `Started`
/// and an `Ended` notification per session, dispatched inline on
/// whichever thread drove the transition.
pub struct RecordSink {
    core: NodeCore,
    queue: Queue,
    sink_id: Option<u32>,
    granted: Option<GrantedPort>,
    outdir: PathBuf,
    container: ContainerKind,
    width: u32,
    height: u32,
    cache_window: Duration,
    max_session: Duration,
    shared: Arc<Mutex<RecordShared>>,
    listeners: Arc<Mutex<ListenerSet<RecordingEvent>>>,
    bus: Option<BusSender>,
    worker: Option<Worker>,
}

impl std::fmt::Debug for RecordSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSink")
            .field("name", &self.core.name())
            .field("outdir", &self.outdir)
            .finish_non_exhaustive()
    }
}

impl RecordSink {
    pub fn new(name: impl Into<String>, outdir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_writer(name, outdir, Box::new(RawDumpWriter::new()))
    }

    pub fn with_writer(
        name: impl Into<String>,
        outdir: impl Into<PathBuf>,
        writer: Box<dyn ContainerWriter>,
    ) -> Result<Self> {
        let name = name.into();
        let outdir = outdir.into();
        if !outdir.is_dir() {
            return Err(FlowError::Configuration(format!(
                "record directory '{}' does not exist",
                outdir.display()
            )));
        }
        let mut core = NodeCore::new(&name, NodeKind::Sink)?;
        core.add_port(Port::new_static("drain", PortRole::Sink))?;
        let queue = Queue::new(format!("{name}-queue"))?;
        Ok(Self {
            core,
            queue,
            sink_id: None,
            granted: None,
            outdir,
            container: ContainerKind::default(),
            width: 1280,
            height: 720,
            cache_window: DEFAULT_CACHE_WINDOW,
            max_session: DEFAULT_MAX_SESSION,
            shared: Arc::new(Mutex::new(RecordShared {
                machine: SessionMachine::new(),
                cache: FrameCache::new(DEFAULT_CACHE_WINDOW),
                writer,
                path: PathBuf::new(),
                live_end: Duration::ZERO,
                written: 0,
            })),
            listeners: Arc::new(Mutex::new(ListenerSet::new(&name))),
            bus: None,
            worker: None,
        })
    }

    pub fn is_on(&self) -> bool {
        self.shared.lock().machine.is_on()
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.lock().machine.state()
    }

    /// Sessions started over the sink's lifetime. Ids are handed out
    /// sequentially, so this equals the most recent session id.
    pub fn session_count(&self) -> u64 {
        self.shared.lock().machine.session_id()
    }

    pub fn cache_window(&self) -> Duration {
        self.cache_window
    }

    /// Resize the pre-event window. Drops the history gathered so far.
    pub fn set_cache_window(&mut self, window: Duration) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.machine.is_on() {
            return Err(FlowError::State(format!(
                "cannot resize the cache of '{}' while a session is {}",
                self.core.name(),
                shared.machine.state()
            )));
        }
        self.cache_window = window;
        shared.cache = FrameCache::new(window);
        Ok(())
    }

    pub fn max_session(&self) -> Duration {
        self.max_session
    }

    pub fn set_max_session(&mut self, limit: Duration) -> Result<()> {
        if self.shared.lock().machine.is_on() {
            return Err(FlowError::State(format!(
                "cannot change the session ceiling of '{}' while recording",
                self.core.name()
            )));
        }
        self.max_session = limit;
        Ok(())
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    pub fn container(&self) -> ContainerKind {
        self.container
    }

    pub fn set_container(&mut self, container: ContainerKind) {
        self.container = container;
    }

    pub fn outdir(&self) -> &Path {
        &self.outdir
    }

    pub fn set_outdir(&mut self, outdir: impl Into<PathBuf>) -> Result<()> {
        let outdir = outdir.into();
        if !outdir.is_dir() {
            return Err(FlowError::Configuration(format!(
                "record directory '{}' does not exist",
                outdir.display()
            )));
        }
        self.outdir = outdir;
        Ok(())
    }

    pub fn add_listener(&self, callback: impl FnMut(&RecordingEvent) + Send + 'static) -> u64 {
        self.listeners.lock().add(callback)
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        self.listeners.lock().remove(id)
    }

    pub fn cached_frames(&self) -> usize {
        self.shared.lock().cache.len()
    }

    pub fn frames_written(&self) -> u64 {
        self.shared.lock().written
    }

    /// Open a session. `start` asks for that much pre-event history,
    /// `duration` for live coverage past the trigger; both are clamped.
    pub fn start_session(&mut self, start: Duration, duration: Duration) -> Result<u64> {
        let window = clamp_session(start, duration, self.cache_window, self.max_session);
        let (session_id, event) = {
            let mut shared = self.shared.lock();
            let session_id = shared.machine.begin(window)?;
            let path = self.outdir.join(format!(
                "{}_{session_id:04}.{}",
                self.core.name(),
                self.container.extension()
            ));
            if let Err(e) = shared.writer.open(&path, self.width, self.height) {
                shared.machine.reset();
                return Err(e);
            }
            let history = shared.cache.snapshot_recent(window.before);
            if let Some(latest) = shared.cache.latest_pts() {
                shared.machine.set_anchor(latest);
            }
            for frame in &history {
                if let Err(e) = shared.writer.write(frame) {
                    let _ = shared.writer.finalize();
                    shared.machine.reset();
                    return Err(e);
                }
            }
            shared.written = history.len() as u64;
            shared.live_end = Duration::ZERO;
            shared.path = path.clone();
            let info = RecordingInfo {
                session_id,
                path,
                duration: window.total(),
                width: self.width,
                height: self.height,
                container: self.container,
            };
            (session_id, RecordingEvent::Started(info))
        };
        info!(
            sink = %self.core.name(),
            session = session_id,
            before = ?window.before,
            after = ?window.after,
            "recording session opened"
        );
        self.listeners.lock().dispatch(&event);
        Ok(session_id)
    }

    /// Close the running session early. Stopping while idle is a
    /// no-op, not an error.
    pub fn stop_session(&mut self) -> Result<bool> {
        let event = {
            let mut shared = self.shared.lock();
            match shared.machine.state() {
                SessionState::Idle => {
                    info!(sink = %self.core.name(), "no recording session to stop");
                    return Ok(false);
                }
                SessionState::Finishing => return Ok(true),
                SessionState::Running => {}
            }
            shared.machine.begin_finishing()?;
            finish_locked(&mut shared, self.width, self.height, self.container)?
        };
        info!(sink = %self.core.name(), session = event.info().session_id, "recording session stopped");
        self.listeners.lock().dispatch(&event);
        Ok(true)
    }
}

/// Finalize the output and produce the `Ended` event. Callers hold the
/// shared lock and must dispatch after releasing it.
fn finish_locked(
    shared: &mut RecordShared,
    width: u32,
    height: u32,
    container: ContainerKind,
) -> Result<RecordingEvent> {
    shared.writer.finalize()?;
    let window = shared.machine.window();
    let duration = match shared.machine.anchor() {
        Some(anchor) => window
            .before
            .saturating_add(shared.live_end.saturating_sub(anchor))
            .min(window.total()),
        None => window.before,
    };
    let info = RecordingInfo {
        session_id: shared.machine.session_id(),
        path: shared.path.clone(),
        duration,
        width,
        height,
        container,
    };
    debug!(
        session = info.session_id,
        written = shared.written,
        duration = ?info.duration,
        "recording finalized"
    );
    shared.machine.complete()?;
    Ok(RecordingEvent::Ended(info))
}

/// Data-path entry: cache always, write while running, finish once the
/// live window is covered.
fn ingest_locked(
    shared: &mut RecordShared,
    frame: Frame,
    width: u32,
    height: u32,
    container: ContainerKind,
) -> Result<Option<RecordingEvent>> {
    match shared.machine.state() {
        SessionState::Idle | SessionState::Finishing => {
            shared.cache.push(frame);
            Ok(None)
        }
        SessionState::Running => {
            shared.machine.set_anchor(frame.pts);
            shared.writer.write(&frame)?;
            shared.written += 1;
            shared.live_end = shared.live_end.max(frame.end_pts());
            let due = shared.machine.end_reached(frame.end_pts());
            shared.cache.push(frame);
            if due {
                shared.machine.begin_finishing()?;
                return Ok(Some(finish_locked(shared, width, height, container)?));
            }
            Ok(None)
        }
    }
}

impl FlowNode for RecordSink {
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
        crate::core::sink::link_queue_to_drain(&name, &mut self.queue, &mut self.core)?;
        self.rewire();
        Ok(())
    }

    fn unlink_all(&mut self) -> Result<()> {
        let name = self.core.name().to_string();
        crate::core::sink::unlink_queue_from_drain(&name, &mut self.queue, &mut self.core)?;
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
        let shared = self.shared.clone();
        let listeners = self.listeners.clone();
        let bus = self.bus.clone();
        let name = self.core.name().to_string();
        let (width, height) = (self.width, self.height);
        let container = self.container;
        self.worker = Some(Worker::spawn(self.core.name(), move |shutdown| {
            drain_loop(rx, shutdown, move |frame| {
                let outcome = {
                    let mut shared = shared.lock();
                    ingest_locked(&mut shared, frame, width, height, container)
                };
                match outcome {
                    Ok(Some(event)) => listeners.lock().dispatch(&event),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(sink = %name, error = %e, "recording write failed");
                        if let Some(bus) = &bus {
                            let _ = bus.send(BusMessage::Error {
                                node: name.clone(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
            });
        })?);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        // Never leave a half-written file behind.
        if self.is_on() {
            self.stop_session()?;
        }
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self.queue.stop()?;
        debug!(sink = %self.core.name(), "record sink stopped");
        Ok(())
    }

    fn rewire(&mut self) {
        self.queue.rewire();
    }

    fn attach_bus(&mut self, bus: &BusSender) {
        self.bus = Some(bus.clone());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl TerminalNode for RecordSink {
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
