// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Recording session state machine and clamp rules.
//!
//! The machine is pure bookkeeping; the record sink owns one behind
//! its shared-state mutex and drives it from both the control path
//! (start/stop requests) and the data path (frame arrival).

use crate::core::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Pre-event history retained while idle.
pub const DEFAULT_CACHE_WINDOW: Duration = Duration::from_secs(60);
/// Hard ceiling on one session, pre-event portion included.
pub const DEFAULT_MAX_SESSION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Finishing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Finishing => "finishing",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    #[default]
    Mp4,
    Mkv,
}

impl ContainerKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerKind::Mp4 => "mp4",
            ContainerKind::Mkv => "mkv",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Effective session extent after clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    /// Stream time replayed from the cache, before the trigger.
    pub before: Duration,
    /// Stream time recorded live, after the trigger.
    pub after: Duration,
}

impl SessionWindow {
    pub fn total(&self) -> Duration {
        self.before.saturating_add(self.after)
    }
}

/// Clamp a start request to what the cache and the session ceiling
/// allow. The pre-event part wins space first; the live part gets the
/// remainder of the ceiling.
pub fn clamp_session(
    start: Duration,
    duration: Duration,
    cache_window: Duration,
    max_session: Duration,
) -> SessionWindow {
    let before = start.min(cache_window);
    let after = duration.min(max_session.saturating_sub(before));
    SessionWindow { before, after }
}

/// What a finished or starting session looks like to listeners.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingInfo {
    pub session_id: u64,
    pub path: PathBuf,
    pub duration: Duration,
    pub width: u32,
    pub height: u32,
    pub container: ContainerKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum RecordingEvent {
    Started(RecordingInfo),
    Ended(RecordingInfo),
}

impl RecordingEvent {
    pub fn info(&self) -> &RecordingInfo {
        match self {
            RecordingEvent::Started(info) | RecordingEvent::Ended(info) => info,
        }
    }
}

/// One-at-a-time session tracker.
///
/// `begin` opens a session and hands out its id; the anchor is the
/// stream time of the trigger, set once the data path knows it, and
/// the end is derived from it. Explicit stops skip straight to
/// `begin_finishing` without waiting for the end.
pub struct SessionMachine {
    state: SessionState,
    next_id: u64,
    session_id: u64,
    window: SessionWindow,
    anchor: Option<Duration>,
    end: Option<Duration>,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            next_id: 1,
            session_id: 0,
            window: SessionWindow {
                before: Duration::ZERO,
                after: Duration::ZERO,
            },
            anchor: None,
            end: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_on(&self) -> bool {
        self.state != SessionState::Idle
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn window(&self) -> SessionWindow {
        self.window
    }

    pub fn anchor(&self) -> Option<Duration> {
        self.anchor
    }

    /// Idle to Running. One session at a time.
    pub fn begin(&mut self, window: SessionWindow) -> Result<u64> {
        if self.state != SessionState::Idle {
            return Err(FlowError::State(format!(
                "recording session {} is already {}",
                self.session_id, self.state
            )));
        }
        self.state = SessionState::Running;
        self.session_id = self.next_id;
        self.next_id += 1;
        self.window = window;
        self.anchor = None;
        self.end = None;
        Ok(self.session_id)
    }

    /// Pin the trigger point in stream time. First caller wins.
    pub fn set_anchor(&mut self, pts: Duration) {
        if self.state == SessionState::Running && self.anchor.is_none() {
            self.anchor = Some(pts);
            self.end = Some(pts.saturating_add(self.window.after));
        }
    }

    /// True once the live portion has covered the requested duration.
    pub fn end_reached(&self, frame_end: Duration) -> bool {
        self.state == SessionState::Running && self.end.is_some_and(|end| frame_end >= end)
    }

    /// Running to Finishing, on end-of-window or an explicit stop.
    pub fn begin_finishing(&mut self) -> Result<()> {
        if self.state != SessionState::Running {
            return Err(FlowError::State(format!(
                "no running recording session to finish (state {})",
                self.state
            )));
        }
        self.state = SessionState::Finishing;
        Ok(())
    }

    /// Finishing to Idle, once the output is finalized.
    pub fn complete(&mut self) -> Result<()> {
        if self.state != SessionState::Finishing {
            return Err(FlowError::State(format!(
                "recording session is not finishing (state {})",
                self.state
            )));
        }
        self.state = SessionState::Idle;
        self.anchor = None;
        self.end = None;
        Ok(())
    }

    /// Drop whatever is in flight and return to Idle.
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.anchor = None;
        self.end = None;
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}
