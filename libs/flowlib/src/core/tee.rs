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
use tracing::{debug, info};

/// Default bound on simultaneous fan-out grants.
pub const DEFAULT_FANOUT_CAPACITY: usize = 4;

#[derive(Default)]
struct TeeShared {
    rx: Option<Receiver<Frame>>,
    lanes: Vec<(String, Sender<Frame>)>,
}

/// Fan-out distribution point.
///
/// Consumers request an on-demand source port by name, link into it, and
/// later release the exact grant they were handed. The worker copies each
/// inbound frame to every linked lane; a full lane drops its copy rather
/// than stalling the others.
pub struct Tee {
    core: NodeCore,
    capacity: usize,
    grants: BTreeMap<String, u64>,
    next_serial: u64,
    shared: Arc<Mutex<TeeShared>>,
    dropped: Arc<AtomicU64>,
    worker: Option<Worker>,
}

impl Tee {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::with_capacity(name, DEFAULT_FANOUT_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Result<Self> {
        let mut core = NodeCore::new(name, NodeKind::Tee)?;
        core.add_port(Port::new_static("sink", PortRole::Sink))?;
        Ok(Self {
            core,
            capacity,
            grants: BTreeMap::new(),
            next_serial: 1,
            shared: Arc::new(Mutex::new(TeeShared::default())),
            dropped: Arc::new(AtomicU64::new(0)),
            worker: None,
        })
    }

    /// Grant an on-demand source port under `port_name`.
    ///
    /// At most one grant per name can be outstanding, and at most
    /// `capacity` grants in total.
    pub fn request_src_port(&mut self, port_name: &str) -> Result<GrantedPort> {
        if self.grants.contains_key(port_name) {
            return Err(FlowError::Structure(format!(
                "'{}' already has an outstanding grant for port '{port_name}'",
                self.core.name()
            )));
        }
        if self.grants.len() >= self.capacity {
            return Err(FlowError::Capacity(format!(
                "'{}' has no free source ports ({} of {} granted)",
                self.core.name(),
                self.grants.len(),
                self.capacity
            )));
        }
        self.core
            .add_port(Port::new_on_demand(port_name, PortRole::Source))?;
        let serial = self.next_serial;
        self.next_serial += 1;
        self.grants.insert(port_name.to_string(), serial);
        debug!(tee = %self.core.name(), port = port_name, serial, "granted source port");
        Ok(GrantedPort::new(self.core.name(), port_name, serial))
    }

    /// Release a grant. Requires the exact token from the matching
    /// request; the port must already be unlinked.
    pub fn release_src_port(&mut self, granted: GrantedPort) -> Result<()> {
        if granted.node() != self.core.name() {
            return Err(FlowError::Structure(format!(
                "grant for '{}' was not issued by '{}'",
                granted.address(),
                self.core.name()
            )));
        }
        match self.grants.get(granted.port_name()) {
            None => {
                return Err(FlowError::Structure(format!(
                    "'{}' has no outstanding grant for port '{}'",
                    self.core.name(),
                    granted.port_name()
                )));
            }
            Some(serial) if *serial != granted.serial() => {
                return Err(FlowError::Structure(format!(
                    "stale grant for port '{}' on '{}'",
                    granted.port_name(),
                    self.core.name()
                )));
            }
            Some(_) => {}
        }
        // remove_port refuses while the port is linked, keeping
        // request/release strictly symmetric around link/unlink.
        self.core.remove_port(granted.port_name())?;
        self.grants.remove(granted.port_name());
        self.rewire();
        debug!(tee = %self.core.name(), port = granted.port_name(), "released source port");
        Ok(())
    }

    pub fn granted_port_names(&self) -> Vec<String> {
        self.grants.keys().cloned().collect()
    }

    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frame copies discarded because a lane was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FlowNode for Tee {
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
                        let lanes = shared.lock().lanes.clone();
                        for (_, lane) in &lanes {
                            if lane.try_send(frame.clone()).is_err() {
                                dropped.fetch_add(1, Ordering::Relaxed);
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
        info!(tee = %self.core.name(), "fan-out started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            debug!(tee = %self.core.name(), dropped = self.dropped(), "fan-out stopped");
        }
        Ok(())
    }

    fn rewire(&mut self) {
        let mut shared = self.shared.lock();
        shared.rx = self.core.port("sink").and_then(|p| p.receiver());
        shared.lanes = self
            .grants
            .keys()
            .filter_map(|name| {
                self.core
                    .port(name)
                    .and_then(|p| p.sender())
                    .map(|tx| (name.clone(), tx))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::port::link_ports;
    use bytes::Bytes;
    use std::time::Duration;

    #[test]
    fn test_grant_capacity_enforced() {
        let mut tee = Tee::with_capacity("tee_test_cap", 2).unwrap();
        let g0 = tee.request_src_port("src_0").unwrap();
        let _g1 = tee.request_src_port("src_1").unwrap();
        let err = tee.request_src_port("src_2").unwrap_err();
        assert!(matches!(err, FlowError::Capacity(_)));

        tee.release_src_port(g0).unwrap();
        let _g2 = tee.request_src_port("src_2").unwrap();
        assert_eq!(tee.granted_port_names(), vec!["src_1", "src_2"]);
    }

    #[test]
    fn test_double_grant_same_name_rejected() {
        let mut tee = Tee::new("tee_test_double").unwrap();
        let _g = tee.request_src_port("src_0").unwrap();
        let err = tee.request_src_port("src_0").unwrap_err();
        assert!(matches!(err, FlowError::Structure(_)));
    }

    #[test]
    fn test_stale_grant_rejected() {
        let mut tee = Tee::new("tee_test_stale").unwrap();
        let g_old = tee.request_src_port("src_0").unwrap();
        let old_serial = {
            // Fabricate a copy of the token, then release the real one.
            let copy = GrantedPort::new("tee_test_stale", "src_0", g_old.serial());
            tee.release_src_port(g_old).unwrap();
            copy
        };
        let _g_new = tee.request_src_port("src_0").unwrap();
        let err = tee.release_src_port(old_serial).unwrap_err();
        assert!(matches!(err, FlowError::Structure(_)));
        assert_eq!(tee.grant_count(), 1);
    }

    #[test]
    fn test_release_while_linked_rejected() {
        let mut tee = Tee::new("tee_test_linked_release").unwrap();
        let granted = tee.request_src_port("src_0").unwrap();
        let mut consumer = Port::new_static("sink", PortRole::Sink);
        link_ports(
            "tee_test_linked_release",
            tee.core_mut().port_mut("src_0").unwrap(),
            "consumer",
            &mut consumer,
            4,
        )
        .unwrap();

        let err = tee.release_src_port(granted).unwrap_err();
        assert!(matches!(err, FlowError::Structure(_)));
        // Grant survives the rejected release.
        assert_eq!(tee.grant_count(), 1);
    }

    #[test]
    fn test_fan_out_copies_to_all_lanes() {
        let mut tee = Tee::new("tee_test_fanout").unwrap();
        let mut feeder = Port::new_static("src", PortRole::Source);
        link_ports(
            "feeder",
            &mut feeder,
            "tee_test_fanout",
            tee.core_mut().port_mut("sink").unwrap(),
            8,
        )
        .unwrap();

        let _g0 = tee.request_src_port("src_0").unwrap();
        let _g1 = tee.request_src_port("src_1").unwrap();
        let mut a = Port::new_static("sink", PortRole::Sink);
        let mut b = Port::new_static("sink", PortRole::Sink);
        link_ports(
            "tee_test_fanout",
            tee.core_mut().port_mut("src_0").unwrap(),
            "a",
            &mut a,
            8,
        )
        .unwrap();
        link_ports(
            "tee_test_fanout",
            tee.core_mut().port_mut("src_1").unwrap(),
            "b",
            &mut b,
            8,
        )
        .unwrap();

        tee.start().unwrap();
        let frame = Frame::new(9, Duration::from_millis(50), Bytes::from_static(b"payload"));
        feeder.sender().unwrap().send(frame.clone()).unwrap();

        let got_a = a.receiver().unwrap().recv_timeout(Duration::from_secs(1)).unwrap();
        let got_b = b.receiver().unwrap().recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got_a, frame);
        assert_eq!(got_b, frame);
        tee.stop().unwrap();
    }
}
