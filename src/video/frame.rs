//! Video frame type and the per-frame callback capability.

use bytes::Bytes;
use std::time::Instant;

/// One encoded video frame as delivered by the source
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Sequence number supplied by the source (monotonically increasing)
    pub sequence: u64,
    /// Encoded bytes (H.264 access unit for a camera source)
    pub payload: Bytes,
    /// Local instant at which the frame reached us
    pub arrival: Instant,
}

impl VideoFrame {
    /// Create a frame stamped with the current instant
    pub fn new(sequence: u64, payload: Bytes) -> Self {
        Self {
            sequence,
            payload,
            arrival: Instant::now(),
        }
    }

    /// Create a frame with an explicit arrival instant
    pub fn with_arrival(sequence: u64, payload: Bytes, arrival: Instant) -> Self {
        Self {
            sequence,
            payload,
            arrival,
        }
    }
}

/// Capability held by a frame source to deliver frames
///
/// Called on whatever thread the source uses; calls from one source are
/// serialized and arrive in order.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: VideoFrame);
}
