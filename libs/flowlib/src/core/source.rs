// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Synthetic frame source.
//!
//! Stream time advances by a fixed step per frame, decoupled from wall
//! time: with no pacing interval the source runs as fast as downstream
//! accepts, which keeps long stream-time scenarios cheap to exercise.

use crate::core::error::Result;
use crate::core::frame::Frame;
use crate::core::node::{FlowNode, NodeCore, NodeKind};
use crate::core::pipeline::{BusMessage, BusSender};
use crate::core::port::{Port, PortRole};
use crate::core::worker::{Worker, POLL_INTERVAL};
use bytes::Bytes;
use crossbeam_channel::{RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Default)]
struct SourceShared {
    tx: Option<Sender<Frame>>,
}

pub struct TestSource {
    core: NodeCore,
    stream_id: u32,
    frame_duration: Duration,
    interval: Duration,
    keyframe_every: u64,
    frame_limit: Option<u64>,
    payload: Bytes,
    shared: Arc<Mutex<SourceShared>>,
    produced: Arc<AtomicU64>,
    bus: Option<BusSender>,
    worker: Option<Worker>,
}

impl TestSource {
    pub fn new(name: impl Into<String>, stream_id: u32) -> Result<Self> {
        let mut core = NodeCore::new(name, NodeKind::Source)?;
        core.add_port(Port::new_static("src", PortRole::Source))?;
        Ok(Self {
            core,
            stream_id,
            frame_duration: Duration::from_millis(33),
            interval: Duration::ZERO,
            keyframe_every: 10,
            frame_limit: None,
            payload: Bytes::from_static(b"frame"),
            shared: Arc::new(Mutex::new(SourceShared::default())),
            produced: Arc::new(AtomicU64::new(0)),
            bus: None,
            worker: None,
        })
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Stream time carried by each frame.
    pub fn set_frame_duration(&mut self, duration: Duration) {
        self.frame_duration = duration;
    }

    /// Wall-clock pacing between frames. Zero means unpaced.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn is_live(&self) -> bool {
        self.interval > Duration::ZERO
    }

    /// Every n-th frame is a keyframe, starting with the first.
    pub fn set_keyframe_every(&mut self, every: u64) {
        self.keyframe_every = every.max(1);
    }

    /// Stop after this many frames and report end of stream on the bus.
    pub fn set_frame_limit(&mut self, limit: Option<u64>) {
        self.frame_limit = limit;
    }

    pub fn set_payload(&mut self, payload: Bytes) {
        self.payload = payload;
    }

    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }
}

impl FlowNode for TestSource {
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
        let produced = self.produced.clone();
        let bus = self.bus.clone();
        let stream_id = self.stream_id;
        let frame_duration = self.frame_duration;
        let interval = self.interval;
        let keyframe_every = self.keyframe_every;
        let frame_limit = self.frame_limit;
        let payload = self.payload.clone();
        let name = self.core.name().to_string();
        self.worker = Some(Worker::spawn(self.core.name(), move |shutdown| {
            // Stream time picks up where the last run left off.
            let mut seq = produced.load(Ordering::Relaxed);
            'produce: loop {
                if shutdown.try_recv().is_ok() {
                    break;
                }
                if frame_limit.is_some_and(|limit| seq >= limit) {
                    info!(source = %name, frames = seq, "frame limit reached");
                    if let Some(bus) = &bus {
                        let _ = bus.send(BusMessage::Eos { node: name.clone() });
                    }
                    break;
                }
                let tx = shared.lock().tx.clone();
                let Some(tx) = tx else {
                    match shutdown.recv_timeout(POLL_INTERVAL) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => continue,
                    }
                };
                let pts = frame_duration.saturating_mul(seq as u32);
                let mut pending = Frame::new(stream_id, pts, payload.clone())
                    .with_timing(frame_duration, seq % keyframe_every == 0);
                loop {
                    match tx.send_timeout(pending, POLL_INTERVAL) {
                        Ok(()) => break,
                        Err(SendTimeoutError::Timeout(frame)) => {
                            if shutdown.try_recv().is_ok() {
                                break 'produce;
                            }
                            pending = frame;
                        }
                        Err(SendTimeoutError::Disconnected(_)) => {
                            let mut s = shared.lock();
                            if s.tx.as_ref().is_some_and(|cur| cur.same_channel(&tx)) {
                                s.tx = None;
                            }
                            continue 'produce;
                        }
                    }
                }
                seq += 1;
                produced.store(seq, Ordering::Relaxed);
                if interval > Duration::ZERO {
                    match shutdown.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }
            }
        })?);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            debug!(source = %self.core.name(), produced = self.produced(), "source stopped");
        }
        Ok(())
    }

    fn rewire(&mut self) {
        let mut shared = self.shared.lock();
        shared.tx = self.core.port("src").and_then(|p| p.sender());
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
