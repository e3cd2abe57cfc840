// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use crate::core::error::{FlowError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// How long worker loops block on a channel before re-checking shutdown.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Handle to a node's data-plane thread.
///
/// Stop sends one shutdown token and joins; the loop body is expected to
/// poll its shutdown receiver at least every [`POLL_INTERVAL`].
pub(crate) struct Worker {
    name: String,
    thread: Option<JoinHandle<()>>,
    shutdown_tx: Sender<()>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let thread = std::thread::Builder::new()
            .name(format!("flow-{name}"))
            .spawn(move || body(shutdown_rx))
            .map_err(|e| {
                FlowError::Runtime(format!("failed to spawn worker thread for '{name}': {e}"))
            })?;
        debug!(worker = name, "worker thread started");
        Ok(Self {
            name: name.to_string(),
            thread: Some(thread),
            shutdown_tx,
        })
    }

    pub(crate) fn stop(&mut self) {
        // Full or disconnected both mean the worker no longer needs the token.
        let _ = self.shutdown_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(()) => debug!(worker = %self.name, "worker thread stopped"),
                Err(_) => warn!(worker = %self.name, "worker thread panicked"),
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}
