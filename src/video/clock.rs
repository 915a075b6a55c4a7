//! # Stream Clock
//!
//! Presentation timing for forwarded frames.
//!
//! The first frame anchors the origin at presentation time zero; every
//! later frame gets the time elapsed since that origin. The clock is never
//! reset during a run.

use std::time::{Duration, Instant};

/// Presentation clock anchored on the first frame
#[derive(Debug, Default, Clone)]
pub struct StreamClock {
    origin: Option<Instant>,
    last_pts: Duration,
    regressions: u64,
}

impl StreamClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presentation time for a frame that arrived at `arrival`
    ///
    /// The first call anchors the origin and returns zero. A frame that
    /// arrives earlier than its predecessor is not reordered; it is counted
    /// in [`regressions`](Self::regressions) and given the time elapsed
    /// since the origin, saturating at zero.
    pub fn presentation_time(&mut self, arrival: Instant) -> Duration {
        let origin = *self.origin.get_or_insert(arrival);
        let pts = arrival.saturating_duration_since(origin);

        if pts < self.last_pts {
            self.regressions += 1;
        }
        self.last_pts = pts;
        pts
    }

    /// Whether the first frame has been seen
    pub fn is_anchored(&self) -> bool {
        self.origin.is_some()
    }

    /// Number of frames whose arrival went backwards
    pub fn regressions(&self) -> u64 {
        self.regressions
    }
}
