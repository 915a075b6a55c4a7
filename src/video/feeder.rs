//! # Stream Feeder
//!
//! Receives every video frame from the source, forwards it into the sink
//! with presentation timing and writes the correlated telemetry row.
//!
//! ## Per-frame steps
//!
//! 1. Presentation time from the [`StreamClock`] (first frame = zero)
//! 2. Fixed nominal duration from the configured frame rate
//! 3. Copy into a sink-owned [`SinkBuffer`] and push; a non-`Ok` flow result
//!    is logged and counted but never stops the feed
//! 4. Snapshot the telemetry mailbox; if a packet is available, append one
//!    row to the correlated log
//!
//! The correlated log therefore has one row per video frame. It repeats a
//! row when telemetry is slower than video and skips packets when telemetry
//! is faster.

use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::clock::StreamClock;
use super::frame::{FrameHandler, VideoFrame};
use super::probe::{now_micros, LatencyProbe};
use crate::context::{CaptureContext, Stats};
use crate::sink::{FlowReturn, SinkBuffer, StreamSink};
use crate::telemetry::logger::TelemetryLogger;
use crate::telemetry::packet::parse_packet;

/// A push failure is logged on the first occurrence and then every Nth
const PUSH_FAILURE_LOG_EVERY: u64 = 100;

struct FeederState {
    clock: StreamClock,
    correlated: TelemetryLogger,
    stopped: bool,
}

/// Frame handler bridging the video source, the sink and the correlated log
pub struct StreamFeeder {
    ctx: Arc<CaptureContext>,
    sink: Arc<dyn StreamSink>,
    frame_duration: Duration,
    probe: Option<LatencyProbe>,
    state: Mutex<FeederState>,
}

impl std::fmt::Debug for StreamFeeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFeeder")
            .field("frame_duration", &self.frame_duration)
            .field("probe", &self.probe)
            .finish_non_exhaustive()
    }
}

impl StreamFeeder {
    /// Create a feeder writing correlated rows to `correlated`
    pub fn new(
        ctx: Arc<CaptureContext>,
        sink: Arc<dyn StreamSink>,
        correlated: TelemetryLogger,
    ) -> Self {
        let frame_duration = ctx.config.video.frame_duration();

        Self {
            ctx,
            sink,
            frame_duration,
            probe: None,
            state: Mutex::new(FeederState {
                clock: StreamClock::new(),
                correlated,
                stopped: false,
            }),
        }
    }

    /// Send a latency probe datagram for every forwarded frame
    pub fn with_probe(mut self, probe: LatencyProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Stop accepting frames and flush the correlated log
    ///
    /// Frames delivered after this call are ignored. Returns the number of
    /// correlated rows written.
    pub fn stop(&self) -> u64 {
        let mut state = self.lock_state();
        if !state.stopped {
            state.stopped = true;
            if let Err(e) = state.correlated.flush() {
                warn!("Failed to flush correlated log: {}", e);
            }
            if state.clock.regressions() > 0 {
                warn!(
                    "{} frames arrived out of order and kept their arrival timing",
                    state.clock.regressions()
                );
            }
            info!(
                "Stream feeder stopped: {} correlated rows in {}",
                state.correlated.records(),
                state.correlated.path().display()
            );
        }
        state.correlated.records()
    }

    fn lock_state(&self) -> MutexGuard<'_, FeederState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn forward(&self, state: &mut FeederState, frame: &VideoFrame) {
        let first = !state.clock.is_anchored();
        let pts = state.clock.presentation_time(frame.arrival);

        if first {
            info!(
                "First video frame at {} (sequence {})",
                chrono::Local::now().to_rfc3339(),
                frame.sequence
            );
        }

        if let Some(probe) = &self.probe {
            probe.send(now_micros());
        }

        let buffer = SinkBuffer {
            pts,
            duration: self.frame_duration,
            offset: frame.sequence,
            data: Bytes::copy_from_slice(&frame.payload),
        };

        match self.sink.push(buffer) {
            FlowReturn::Ok => {
                Stats::bump(&self.ctx.stats.frames_pushed);
            }
            flow => {
                let failures = Stats::bump(&self.ctx.stats.push_failures);
                if failures == 1 || failures % PUSH_FAILURE_LOG_EVERY == 0 {
                    warn!(
                        "Sink push returned {} for frame {} ({} failures so far)",
                        flow, frame.sequence, failures
                    );
                }
            }
        }
    }

    fn correlate(&self, state: &mut FeederState) {
        let Some(raw) = self.ctx.mailbox.snapshot() else {
            Stats::bump(&self.ctx.stats.frames_without_telemetry);
            return;
        };

        // Only valid packets are ever published
        let Some(packet) = parse_packet(&raw) else {
            return;
        };

        // One row per frame, written out before the next frame arrives
        match state
            .correlated
            .append(&packet)
            .and_then(|()| state.correlated.flush())
        {
            Ok(()) => {
                Stats::bump(&self.ctx.stats.correlated_rows);
            }
            Err(e) => warn!("Failed to write correlated telemetry row: {}", e),
        }
    }
}

impl FrameHandler for StreamFeeder {
    fn on_frame(&self, frame: VideoFrame) {
        if frame.payload.is_empty() {
            debug!("Ignoring empty frame {}", frame.sequence);
            return;
        }

        let mut state = self.lock_state();
        if state.stopped {
            return;
        }

        self.forward(&mut state, &frame);
        self.correlate(&mut state);
    }
}
