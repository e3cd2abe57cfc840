// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Outbound message publishing.
//!
//! The engine never talks to a wire protocol directly; it hands JSON
//! payloads to a [`MessageBroker`] keyed by topic. The loopback broker
//! keeps everything in process, which is all the tests and local
//! deployments need.

use crate::core::error::{FlowError, Result};
use crate::core::events::ListenerSet;
use crate::core::pipeline::Pipeline;
use crate::core::record::RecordSink;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type SubscriberFn = Box<dyn FnMut(&str, &[u8]) + Send>;

/// Receives `true` on connect, `false` on disconnect.
pub type ConnectionListenerFn = Box<dyn FnMut(&bool) + Send>;

/// Connect / disconnect / fire-and-forget send / subscribe, keyed by
/// topic strings. Implementations decide what a topic maps to.
pub trait MessageBroker: Send {
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
    fn send_async(&mut self, topic: &str, payload: &[u8]) -> Result<()>;
    fn subscribe(&mut self, topic: &str, callback: SubscriberFn) -> Result<u64>;
    fn unsubscribe(&mut self, topic: &str, id: u64) -> Result<()>;
    fn add_connection_listener(&mut self, callback: ConnectionListenerFn) -> Result<u64>;
    fn remove_connection_listener(&mut self, id: u64) -> Result<()>;
}

struct Subscriber {
    id: u64,
    enabled: bool,
    callback: SubscriberFn,
}

/// In-process broker: a send is delivered synchronously to every
/// subscriber of that topic, on the sending thread.
///
/// Subscribers and connection listeners must not call back into the
/// broker that invoked them; delivery holds the owner's lock.
pub struct LoopbackBroker {
    name: String,
    connected: bool,
    next_id: u64,
    topics: HashMap<String, Vec<Subscriber>>,
    connection_listeners: ListenerSet<bool>,
    delivered: u64,
}

impl LoopbackBroker {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            connected: false,
            next_id: 1,
            topics: HashMap::new(),
            connection_listeners: ListenerSet::new(name.clone()),
            delivered: 0,
            name,
        }
    }

    /// Messages actually handed to a subscriber.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl MessageBroker for LoopbackBroker {
    fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Err(FlowError::State(format!(
                "broker '{}' is already connected",
                self.name
            )));
        }
        self.connected = true;
        info!(broker = %self.name, "broker connected");
        self.connection_listeners.dispatch(&true);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Err(FlowError::State(format!(
                "broker '{}' is not connected",
                self.name
            )));
        }
        self.connected = false;
        info!(broker = %self.name, "broker disconnected");
        self.connection_listeners.dispatch(&false);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send_async(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(FlowError::State(format!(
                "broker '{}' is not connected",
                self.name
            )));
        }
        let Some(subscribers) = self.topics.get_mut(topic) else {
            return Ok(());
        };
        for subscriber in subscribers.iter_mut() {
            if !subscriber.enabled {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(topic, payload)));
            if outcome.is_err() {
                subscriber.enabled = false;
                warn!(
                    broker = %self.name,
                    topic,
                    subscriber = subscriber.id,
                    "subscriber panicked, disabling it"
                );
            } else {
                self.delivered += 1;
            }
        }
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, callback: SubscriberFn) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        self.topics.entry(topic.to_string()).or_default().push(Subscriber {
            id,
            enabled: true,
            callback,
        });
        debug!(broker = %self.name, topic, subscriber = id, "subscribed");
        Ok(id)
    }

    fn unsubscribe(&mut self, topic: &str, id: u64) -> Result<()> {
        let subscribers = self.topics.get_mut(topic).ok_or_else(|| {
            FlowError::NotFound(format!(
                "broker '{}' has no subscribers on '{topic}'",
                self.name
            ))
        })?;
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        if subscribers.len() == before {
            return Err(FlowError::NotFound(format!(
                "subscriber {id} not found on '{topic}'"
            )));
        }
        Ok(())
    }

    fn add_connection_listener(&mut self, callback: ConnectionListenerFn) -> Result<u64> {
        Ok(self.connection_listeners.add(callback))
    }

    fn remove_connection_listener(&mut self, id: u64) -> Result<()> {
        if self.connection_listeners.remove(id) {
            Ok(())
        } else {
            Err(FlowError::NotFound(format!(
                "connection listener {id} not found on broker '{}'",
                self.name
            )))
        }
    }
}

fn publish<T: Serialize>(broker: &Arc<Mutex<Box<dyn MessageBroker>>>, topic: &str, event: &T) {
    match serde_json::to_vec(event) {
        Ok(payload) => {
            // A disconnected broker is not an engine fault.
            if let Err(e) = broker.lock().send_async(topic, &payload) {
                debug!(topic, error = %e, "event publish skipped");
            }
        }
        Err(e) => warn!(topic, error = %e, "event serialization failed"),
    }
}

/// Forwards graph notifications to a broker as JSON.
///
/// Topics are `{prefix}/state`, `{prefix}/eos`, `{prefix}/error` and
/// `{prefix}/recording`. Wiring registers ordinary listeners, so
/// publishing happens inline with the dispatch that produced the
/// event.
pub struct EventBridge {
    broker: Arc<Mutex<Box<dyn MessageBroker>>>,
    prefix: String,
}

impl EventBridge {
    pub fn new(broker: Box<dyn MessageBroker>, prefix: impl Into<String>) -> Self {
        Self {
            broker: Arc::new(Mutex::new(broker)),
            prefix: prefix.into(),
        }
    }

    pub fn broker(&self) -> Arc<Mutex<Box<dyn MessageBroker>>> {
        self.broker.clone()
    }

    pub fn connect(&self) -> Result<()> {
        self.broker.lock().connect()
    }

    pub fn disconnect(&self) -> Result<()> {
        self.broker.lock().disconnect()
    }

    pub fn wire_pipeline(&self, pipeline: &mut Pipeline) {
        let topic = format!("{}/state", self.prefix);
        let broker = self.broker.clone();
        pipeline.add_state_listener(move |transition| publish(&broker, &topic, transition));

        let topic = format!("{}/eos", self.prefix);
        let broker = self.broker.clone();
        pipeline.add_eos_listener(move |event| publish(&broker, &topic, event));

        let topic = format!("{}/error", self.prefix);
        let broker = self.broker.clone();
        pipeline.add_error_listener(move |event| publish(&broker, &topic, event));
    }

    pub fn wire_record_sink(&self, sink: &RecordSink) {
        let topic = format!("{}/recording", self.prefix);
        let broker = self.broker.clone();
        sink.add_listener(move |event| publish(&broker, &topic, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_requires_connection() {
        let mut broker = LoopbackBroker::new("broker_test_conn");
        let err = broker.send_async("alerts", b"x").unwrap_err();
        assert!(matches!(err, FlowError::State(_)));
        broker.connect().unwrap();
        assert!(matches!(broker.connect().unwrap_err(), FlowError::State(_)));
        broker.send_async("alerts", b"x").unwrap();
        broker.disconnect().unwrap();
        assert!(matches!(
            broker.disconnect().unwrap_err(),
            FlowError::State(_)
        ));
    }

    #[test]
    fn test_connection_listener_sees_both_edges() {
        let mut broker = LoopbackBroker::new("broker_test_edges");
        let edges = Arc::new(Mutex::new(Vec::new()));
        let sink = edges.clone();
        let id = broker
            .add_connection_listener(Box::new(move |up: &bool| sink.lock().push(*up)))
            .unwrap();

        broker.connect().unwrap();
        broker.disconnect().unwrap();
        assert_eq!(*edges.lock(), vec![true, false]);

        broker.remove_connection_listener(id).unwrap();
        assert!(matches!(
            broker.remove_connection_listener(id).unwrap_err(),
            FlowError::NotFound(_)
        ));
        broker.connect().unwrap();
        assert_eq!(edges.lock().len(), 2);
    }

    #[test]
    fn test_loopback_round_trip() {
        let mut broker = LoopbackBroker::new("broker_test_rt");
        broker.connect().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = broker
            .subscribe(
                "alerts",
                Box::new(move |topic: &str, payload: &[u8]| {
                    sink.lock().push((topic.to_string(), payload.to_vec()));
                }),
            )
            .unwrap();

        broker.send_async("alerts", b"hello").unwrap();
        broker.send_async("other", b"ignored").unwrap();
        assert_eq!(broker.delivered(), 1);
        assert_eq!(
            *seen.lock(),
            vec![("alerts".to_string(), b"hello".to_vec())]
        );

        broker.unsubscribe("alerts", id).unwrap();
        assert!(matches!(
            broker.unsubscribe("alerts", id).unwrap_err(),
            FlowError::NotFound(_)
        ));
        broker.send_async("alerts", b"again").unwrap();
        assert_eq!(broker.delivered(), 1);
    }

    #[test]
    fn test_panicking_subscriber_is_disabled() {
        let mut broker = LoopbackBroker::new("broker_test_panic");
        broker.connect().unwrap();
        broker
            .subscribe("alerts", Box::new(|_: &str, _: &[u8]| panic!("boom")))
            .unwrap();
        broker.send_async("alerts", b"one").unwrap();
        broker.send_async("alerts", b"two").unwrap();
        // Nothing was delivered, and the second send skipped the
        // disabled subscriber without panicking again.
        assert_eq!(broker.delivered(), 0);
    }

    #[test]
    fn test_bridge_publishes_state_transitions() {
        let mut broker = LoopbackBroker::new("broker_test_bridge");
        broker.connect().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        broker
            .subscribe(
                "events/state",
                Box::new(move |_: &str, payload: &[u8]| {
                    sink.lock().push(payload.to_vec());
                }),
            )
            .unwrap();

        let bridge = EventBridge::new(Box::new(broker), "events");
        let mut pipeline = Pipeline::new("broker_test_bridge_pipe").unwrap();
        pipeline
            .add_node(Box::new(
                crate::core::queue::Queue::new("broker_test_bridge_q").unwrap(),
            ))
            .unwrap();
        bridge.wire_pipeline(&mut pipeline);

        pipeline.play().unwrap();
        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 3);
            let first: serde_json::Value = serde_json::from_slice(&seen[0]).unwrap();
            assert_eq!(first["old"], "null");
            assert_eq!(first["new"], "ready");
            let last: serde_json::Value = serde_json::from_slice(&seen[2]).unwrap();
            assert_eq!(last["new"], "playing");
        }
        pipeline.stop().unwrap();
    }
}
