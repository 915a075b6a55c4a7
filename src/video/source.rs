//! # Frame Sources
//!
//! Producers of encoded video frames. Each source runs on its own OS thread
//! and calls [`FrameHandler::on_frame`] once per frame, in order.
//!
//! This module handles:
//! - Synthetic frames at a fixed rate (bench runs without a camera)
//! - Length-prefixed frames read from a file or from stdin
//! - Signalling end of input through a cancellation token

use bytes::Bytes;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::frame::{FrameHandler, VideoFrame};
use crate::config::{SourceKind, VideoConfig};
use crate::error::{CaptureSyncError, Result};

/// Largest frame accepted from a length-prefixed stream
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Input path meaning "read from stdin"
pub const STDIN_PATH: &str = "-";

/// A producer of video frames
pub trait FrameSource: Send {
    /// Start delivering frames to `handler`
    ///
    /// # Errors
    ///
    /// Returns `Source` error if the input cannot be opened or the worker
    /// thread cannot be spawned
    fn start(&mut self, handler: Arc<dyn FrameHandler>) -> Result<()>;

    /// Stop delivering frames; no `on_frame` call starts after this returns
    fn stop(&mut self);

    /// Token cancelled when the source runs out of input on its own
    fn end_of_input(&self) -> CancellationToken;

    /// Human readable name for logs
    fn name(&self) -> &str;
}

/// Build the source selected in the configuration
pub fn from_config(config: &VideoConfig) -> Box<dyn FrameSource> {
    match config.source {
        SourceKind::Synthetic => Box::new(SyntheticSource::new(
            config.frame_duration(),
            config.synthetic_frame_bytes,
            config.synthetic_frame_limit,
        )),
        SourceKind::Reader => Box::new(ReaderSource::new(
            config.input_path.clone(),
            config.frame_duration(),
        )),
    }
}

/// Worker thread bookkeeping shared by both sources
#[derive(Debug, Default)]
struct Worker {
    running: Arc<AtomicBool>,
    ended: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn<F>(&mut self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce(Arc<AtomicBool>, CancellationToken) + Send + 'static,
    {
        if self.thread.is_some() {
            return Err(CaptureSyncError::Source(format!("{} already started", name)));
        }

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let ended = self.ended.clone();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(running, ended))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                CaptureSyncError::Source(format!("Failed to spawn {} thread: {}", name, e))
            })?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self, join: bool) {
        self.running.store(false, Ordering::SeqCst);
        let Some(thread) = self.thread.take() else {
            return;
        };

        if !join {
            // Blocked on a read we cannot interrupt; the flag keeps it from
            // delivering anything further
            return;
        }
        if thread.join().is_err() {
            error!("Frame source thread panicked");
        }
    }
}

/// When frame `sequence` is due, counting from `start`
fn frame_deadline(start: Instant, frame_duration: Duration, sequence: u64) -> Instant {
    let nanos = frame_duration.as_nanos().saturating_mul(u128::from(sequence));
    let offset = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
    // Unrepresentable deadlines are never reached in practice; don't pace
    start.checked_add(offset).unwrap_or_else(Instant::now)
}

/// Sleep until `deadline` unless the source is stopped first
fn pace(deadline: Instant, running: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(10);

    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SLICE));
    }
}

/// Fixed-rate generator of synthetic frames
#[derive(Debug)]
pub struct SyntheticSource {
    frame_duration: Duration,
    frame_bytes: usize,
    /// 0 = unlimited
    limit: u64,
    worker: Worker,
}

impl SyntheticSource {
    pub fn new(frame_duration: Duration, frame_bytes: usize, limit: u64) -> Self {
        Self {
            frame_duration,
            frame_bytes: frame_bytes.max(8),
            limit,
            worker: Worker::default(),
        }
    }

    /// Payload for frame `sequence`: the sequence number followed by filler
    pub fn payload(sequence: u64, frame_bytes: usize) -> Bytes {
        let mut data = vec![sequence as u8; frame_bytes.max(8)];
        data[..8].copy_from_slice(&sequence.to_le_bytes());
        Bytes::from(data)
    }
}

impl FrameSource for SyntheticSource {
    fn start(&mut self, handler: Arc<dyn FrameHandler>) -> Result<()> {
        let frame_duration = self.frame_duration;
        let frame_bytes = self.frame_bytes;
        let limit = self.limit;

        info!(
            "Synthetic source: {} byte frames every {:?}{}",
            frame_bytes,
            frame_duration,
            if limit > 0 {
                format!(", {} frames", limit)
            } else {
                String::new()
            }
        );

        self.worker.spawn("synthetic-source", move |running, ended| {
            let start = Instant::now();
            let mut sequence = 0u64;

            while running.load(Ordering::SeqCst) {
                if limit > 0 && sequence >= limit {
                    info!("Synthetic source finished after {} frames", sequence);
                    ended.cancel();
                    break;
                }

                pace(frame_deadline(start, frame_duration, sequence), &running);
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                handler.on_frame(VideoFrame::new(
                    sequence,
                    Self::payload(sequence, frame_bytes),
                ));
                sequence += 1;
            }
            debug!("Synthetic source thread exiting");
        })
    }

    fn stop(&mut self) {
        self.worker.stop(true);
    }

    fn end_of_input(&self) -> CancellationToken {
        self.worker.ended.clone()
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

/// Reader of length-prefixed frames from a file or stdin
///
/// Each frame is a little-endian `u32` length followed by that many bytes.
/// A file is replayed at the configured frame rate; stdin is delivered as
/// fast as the producer writes it.
#[derive(Debug)]
pub struct ReaderSource {
    path: String,
    frame_duration: Duration,
    worker: Worker,
}

impl ReaderSource {
    pub fn new(path: impl Into<String>, frame_duration: Duration) -> Self {
        Self {
            path: path.into(),
            frame_duration,
            worker: Worker::default(),
        }
    }

    fn is_stdin(&self) -> bool {
        self.path == STDIN_PATH
    }
}

/// Read one length-prefixed frame; `Ok(None)` on a clean end of input
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds {} byte limit", len, MAX_FRAME_SIZE),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(Some(Bytes::from(data)))
}

fn deliver_frames<R: Read>(
    mut reader: R,
    handler: &dyn FrameHandler,
    running: &AtomicBool,
    pacing: Option<Duration>,
) -> io::Result<u64> {
    let start = Instant::now();
    let mut sequence = 0u64;

    while running.load(Ordering::SeqCst) {
        let Some(payload) = read_frame(&mut reader)? else {
            break;
        };

        if let Some(frame_duration) = pacing {
            pace(frame_deadline(start, frame_duration, sequence), running);
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }

        handler.on_frame(VideoFrame::new(sequence, payload));
        sequence += 1;
    }
    Ok(sequence)
}

impl FrameSource for ReaderSource {
    fn start(&mut self, handler: Arc<dyn FrameHandler>) -> Result<()> {
        let input: Box<dyn Read + Send> = if self.is_stdin() {
            info!("Reading video frames from stdin");
            Box::new(io::stdin())
        } else {
            let file = File::open(&self.path).map_err(|e| {
                CaptureSyncError::Source(format!("Failed to open {}: {}", self.path, e))
            })?;
            info!("Replaying video frames from {}", self.path);
            Box::new(file)
        };

        let pacing = (!self.is_stdin()).then_some(self.frame_duration);

        self.worker.spawn("reader-source", move |running, ended| {
            match deliver_frames(BufReader::new(input), handler.as_ref(), &running, pacing) {
                Ok(frames) if running.load(Ordering::SeqCst) => {
                    info!("End of video input after {} frames", frames);
                }
                Ok(frames) => debug!("Reader source stopped after {} frames", frames),
                Err(e) => error!("Video input failed: {}", e),
            }
            ended.cancel();
        })
    }

    fn stop(&mut self) {
        let join = !self.is_stdin();
        if !join {
            warn!("Not waiting for the stdin reader thread");
        }
        self.worker.stop(join);
    }

    fn end_of_input(&self) -> CancellationToken {
        self.worker.ended.clone()
    }

    fn name(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Source driven by the test through [`MockSource::emit`]
    ///
    /// Clones share state, so a test can keep one while the pipeline owns
    /// another.
    #[derive(Default, Clone)]
    pub struct MockSource {
        pub handler: Arc<Mutex<Option<Arc<dyn FrameHandler>>>>,
        pub started: Arc<AtomicBool>,
        pub stop_calls: Arc<Mutex<usize>>,
        pub fail_start: bool,
        ended: CancellationToken,
    }

    impl MockSource {
        pub fn new() -> Self {
            Self::default()
        }

        /// Source whose `start` fails
        pub fn failing() -> Self {
            Self {
                fail_start: true,
                ..Self::default()
            }
        }

        /// Deliver a frame as the source thread would
        pub fn emit(&self, frame: VideoFrame) {
            if !self.started.load(Ordering::SeqCst) {
                return;
            }
            if let Some(handler) = self.handler.lock().unwrap().as_ref() {
                handler.on_frame(frame);
            }
        }

        pub fn finish(&self) {
            self.ended.cancel();
        }
    }

    impl FrameSource for MockSource {
        fn start(&mut self, handler: Arc<dyn FrameHandler>) -> Result<()> {
            if self.fail_start {
                return Err(CaptureSyncError::Source("mock start failure".to_string()));
            }
            *self.handler.lock().unwrap() = Some(handler);
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) {
            self.started.store(false, Ordering::SeqCst);
            *self.stop_calls.lock().unwrap() += 1;
        }

        fn end_of_input(&self) -> CancellationToken {
            self.ended.clone()
        }

        fn name(&self) -> &str {
            "mock"
        }
    }
}
