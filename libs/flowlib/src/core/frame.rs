use bytes::Bytes;
use std::time::Duration;

/// Unit of flow through the graph.
///
/// Frames are tagged with the id of the stream they belong to and carry
/// presentation timing. Payloads are reference-counted, so fanning a frame
/// out to several consumers never copies the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream this frame belongs to. Demultiplexers route on this tag,
    /// multiplexers re-tag with the id bound to the receiving port.
    pub stream_id: u32,
    /// Presentation timestamp.
    pub pts: Duration,
    /// Nominal duration of this frame.
    pub duration: Duration,
    /// True if this frame can be decoded without earlier frames.
    pub keyframe: bool,
    /// Opaque payload. The engine never inspects it.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: u32, pts: Duration, payload: Bytes) -> Self {
        Self {
            stream_id,
            pts,
            duration: Duration::ZERO,
            keyframe: false,
            payload,
        }
    }

    pub fn with_timing(mut self, duration: Duration, keyframe: bool) -> Self {
        self.duration = duration;
        self.keyframe = keyframe;
        self
    }

    /// Timestamp just past the end of this frame.
    pub fn end_pts(&self) -> Duration {
        self.pts + self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_pts_spans_duration() {
        let frame = Frame::new(3, Duration::from_millis(100), Bytes::new())
            .with_timing(Duration::from_millis(40), true);
        assert_eq!(frame.end_pts(), Duration::from_millis(140));
        assert_eq!(frame.stream_id, 3);
        assert!(frame.keyframe);
    }
}
