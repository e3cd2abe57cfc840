use crate::core::error::Result;
use crate::core::frame::Frame;
use crate::core::node::{FlowNode, NodeCore, NodeKind};
use crate::core::port::{Port, PortRole};
use crate::core::worker::{Worker, POLL_INTERVAL};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct QueueShared {
    rx: Option<Receiver<Frame>>,
    tx: Option<Sender<Frame>>,
}

/// Pass-through stage decoupling its upstream from its downstream.
///
/// The worker pumps frames from the sink port to the source port. A full
/// downstream lane drops the frame rather than blocking the pump; drops
/// are counted, never logged per frame.
pub struct Queue {
    core: NodeCore,
    shared: Arc<Mutex<QueueShared>>,
    dropped: Arc<AtomicU64>,
    worker: Option<Worker>,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let mut core = NodeCore::new(name, NodeKind::Queue)?;
        core.add_port(Port::new_static("sink", PortRole::Sink))?;
        core.add_port(Port::new_static("src", PortRole::Source))?;
        Ok(Self {
            core,
            shared: Arc::new(Mutex::new(QueueShared::default())),
            dropped: Arc::new(AtomicU64::new(0)),
            worker: None,
        })
    }

    /// Frames discarded because the downstream lane was full or absent.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FlowNode for Queue {
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
                let rx = shared.lock().rx.clone();
                let Some(rx) = rx else {
                    match shutdown.recv_timeout(POLL_INTERVAL) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => continue,
                    }
                };
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(frame) => {
                        let tx = shared.lock().tx.clone();
                        match tx {
                            Some(tx) if tx.try_send(frame).is_ok() => {}
                            _ => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        // Upstream unlinked under us. Forget this endpoint
                        // unless a rewire already installed a fresh one.
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
            debug!(queue = %self.core.name(), dropped = self.dropped(), "queue stopped");
        }
        Ok(())
    }

    fn rewire(&mut self) {
        let mut shared = self.shared.lock();
        shared.rx = self.core.port("sink").and_then(|p| p.receiver());
        shared.tx = self.core.port("src").and_then(|p| p.sender());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
