//! # File Sink
//!
//! Writes pushed frames, in order, to a raw elementary-stream file.
//!
//! ```text
//! push() ──try_send──▶ [bounded queue] ──▶ writer task ──▶ file
//!                                               │
//! end_of_stream() ──▶ eos token ────────────────┘──▶ drain, flush, fsync
//!                                                     └──▶ SinkEvent::Finalized
//! ```
//!
//! `push` never blocks: when the queue is full the buffer is dropped and
//! [`FlowReturn::Full`] is returned (newest frames are the ones lost).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{FlowReturn, SinkBuffer, SinkEvent, SinkEvents, StreamSink};
use crate::error::{CaptureSyncError, Result};

/// Container file sink
pub struct FileSink {
    queue: mpsc::Sender<SinkBuffer>,
    eos: CancellationToken,
    eos_sent: AtomicBool,
    path: PathBuf,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("path", &self.path)
            .field("eos_sent", &self.eos_sent.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Totals reported when the container is finalized
#[derive(Debug, Default, Clone, Copy)]
struct WriteTotals {
    buffers: u64,
    bytes: u64,
    last_pts: Duration,
}

impl FileSink {
    /// Create the container file and start the writer task
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `path` - Container file to create (truncated if present)
    /// * `capacity` - Number of buffers the queue holds before dropping
    ///
    /// # Errors
    ///
    /// Returns `Sink` error if the file cannot be created
    pub async fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<(Self, SinkEvents)> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .await
            .map_err(|e| CaptureSyncError::Sink(format!("Failed to create {}: {}", path.display(), e)))?;
        info!("Recording video to {}", path.display());

        let (queue, rx) = mpsc::channel(capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let eos = CancellationToken::new();

        tokio::spawn(write_loop(file, rx, eos.clone(), events_tx));

        Ok((
            Self {
                queue,
                eos,
                eos_sent: AtomicBool::new(false),
                path,
            },
            events_rx,
        ))
    }

    /// Path of the container file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StreamSink for FileSink {
    fn push(&self, buffer: SinkBuffer) -> FlowReturn {
        if self.eos_sent.load(Ordering::Acquire) {
            return FlowReturn::Eos;
        }

        match self.queue.try_send(buffer) {
            Ok(()) => FlowReturn::Ok,
            Err(mpsc::error::TrySendError::Full(_)) => FlowReturn::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => FlowReturn::Error,
        }
    }

    fn end_of_stream(&self) -> FlowReturn {
        if self.eos_sent.swap(true, Ordering::AcqRel) {
            return FlowReturn::Eos;
        }
        debug!("End of stream sent to {}", self.path.display());
        self.eos.cancel();
        FlowReturn::Ok
    }
}

async fn write_loop(
    file: File,
    mut rx: mpsc::Receiver<SinkBuffer>,
    eos: CancellationToken,
    events: mpsc::UnboundedSender<SinkEvent>,
) {
    let mut writer = BufWriter::new(file);
    let mut totals = WriteTotals::default();

    loop {
        tokio::select! {
            biased;
            buffer = rx.recv() => match buffer {
                Some(buffer) => {
                    if let Err(e) = write_buffer(&mut writer, &buffer, &mut totals).await {
                        fail(&events, format!("write failed: {}", e));
                        return;
                    }
                }
                // Sink dropped without end-of-stream: finalize what we have
                None => break,
            },
            _ = eos.cancelled() => break,
        }
    }

    // Everything queued before end-of-stream still goes to the file
    rx.close();
    while let Some(buffer) = rx.recv().await {
        if let Err(e) = write_buffer(&mut writer, &buffer, &mut totals).await {
            fail(&events, format!("write failed: {}", e));
            return;
        }
    }

    if let Err(e) = writer.flush().await {
        fail(&events, format!("flush failed: {}", e));
        return;
    }
    if let Err(e) = writer.get_ref().sync_all().await {
        fail(&events, format!("sync failed: {}", e));
        return;
    }

    info!(
        "Container finalized: {} frames, {} bytes, last pts {:?}",
        totals.buffers, totals.bytes, totals.last_pts
    );
    let _ = events.send(SinkEvent::Finalized);
}

async fn write_buffer(
    writer: &mut BufWriter<File>,
    buffer: &SinkBuffer,
    totals: &mut WriteTotals,
) -> std::io::Result<()> {
    writer.write_all(&buffer.data).await?;
    totals.buffers += 1;
    totals.bytes += buffer.data.len() as u64;
    totals.last_pts = buffer.pts;
    Ok(())
}

fn fail(events: &mpsc::UnboundedSender<SinkEvent>, message: String) {
    error!("Sink error: {}", message);
    let _ = events.send(SinkEvent::Error(message));
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn buffer(offset: u64, data: &[u8]) -> SinkBuffer {
        SinkBuffer {
            pts: Duration::from_millis(offset * 33),
            duration: Duration::from_millis(33),
            offset,
            data: Bytes::copy_from_slice(data),
        }
    }

    async fn expect_event(events: &mut SinkEvents) -> SinkEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no sink event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_writes_in_order_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h264");
        let (sink, mut events) = FileSink::create(&path, 16).await.unwrap();

        assert_eq!(sink.push(buffer(0, b"aaa")), FlowReturn::Ok);
        assert_eq!(sink.push(buffer(1, b"bb")), FlowReturn::Ok);
        assert_eq!(sink.push(buffer(2, b"c")), FlowReturn::Ok);
        assert_eq!(sink.end_of_stream(), FlowReturn::Ok);

        assert_eq!(expect_event(&mut events).await, SinkEvent::Finalized);
        assert_eq!(std::fs::read(&path).unwrap(), b"aaabbc");
    }

    #[tokio::test]
    async fn test_push_after_eos_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, mut events) = FileSink::create(dir.path().join("o.h264"), 4).await.unwrap();

        assert_eq!(sink.end_of_stream(), FlowReturn::Ok);
        assert_eq!(sink.end_of_stream(), FlowReturn::Eos);
        assert_eq!(sink.push(buffer(0, b"late")), FlowReturn::Eos);

        assert_eq!(expect_event(&mut events).await, SinkEvent::Finalized);
        assert_eq!(std::fs::read(sink.path()).unwrap(), b"");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops_newest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("o.h264");
        let (sink, mut events) = FileSink::create(&path, 2).await.unwrap();

        // The writer task cannot run until we yield, so the queue fills up
        assert_eq!(sink.push(buffer(0, b"1")), FlowReturn::Ok);
        assert_eq!(sink.push(buffer(1, b"2")), FlowReturn::Ok);
        assert_eq!(sink.push(buffer(2, b"3")), FlowReturn::Full);

        sink.end_of_stream();
        assert_eq!(expect_event(&mut events).await, SinkEvent::Finalized);
        assert_eq!(std::fs::read(&path).unwrap(), b"12");
    }

    #[tokio::test]
    async fn test_drop_without_eos_still_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("o.h264");
        let (sink, mut events) = FileSink::create(&path, 4).await.unwrap();

        sink.push(buffer(0, b"xyz"));
        drop(sink);

        assert_eq!(expect_event(&mut events).await, SinkEvent::Finalized);
        assert_eq!(std::fs::read(&path).unwrap(), b"xyz");
    }

    #[tokio::test]
    async fn test_create_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileSink::create(dir.path().join("missing/o.h264"), 4).await;
        assert!(matches!(result, Err(CaptureSyncError::Sink(_))));
    }
}
