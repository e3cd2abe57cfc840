// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Rolling pre-event frame cache.
//!
//! One writer appends on the data path; the control path takes a bulk
//! snapshot when a recording session opens. Callers wrap the cache in
//! the owning sink's shared-state mutex, the cache itself is plain.

use crate::core::frame::Frame;
use std::collections::VecDeque;
use std::time::Duration;

/// Bounded by stream time, not element count: frames stay until their
/// end falls more than `window` behind the newest pts.
pub struct FrameCache {
    window: Duration,
    frames: VecDeque<Frame>,
}

impl FrameCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            frames: VecDeque::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn latest_pts(&self) -> Option<Duration> {
        self.frames.back().map(|f| f.pts)
    }

    /// Append a frame and evict everything that fell out of the window.
    pub fn push(&mut self, frame: Frame) {
        let newest = frame.pts;
        self.frames.push_back(frame);
        let cutoff = newest.saturating_sub(self.window);
        while let Some(front) = self.frames.front() {
            if front.end_pts() > cutoff {
                break;
            }
            self.frames.pop_front();
        }
    }

    /// Copy out the frames covering the last `before` of stream time.
    ///
    /// The copy is widened backwards to the nearest keyframe so a
    /// decoder can pick up at the first returned frame.
    pub fn snapshot_recent(&self, before: Duration) -> Vec<Frame> {
        let Some(latest) = self.latest_pts() else {
            return Vec::new();
        };
        let cutoff = latest.saturating_sub(before);
        let mut start = self
            .frames
            .iter()
            .position(|f| f.end_pts() > cutoff)
            .unwrap_or(self.frames.len());
        if start < self.frames.len() {
            while start > 0 && !self.frames[start].keyframe {
                start -= 1;
            }
        }
        self.frames.iter().skip(start).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
