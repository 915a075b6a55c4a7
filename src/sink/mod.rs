//! # Sink Module
//!
//! Downstream consumer of encoded video frames.
//!
//! The capture side depends on three sink operations only:
//! - push one timed buffer, with a flow-control result
//! - send an end-of-stream marker
//! - an asynchronous channel of completion/error events
//!
//! The actual muxing is the sink's business; [`file::FileSink`] is the
//! implementation used by the binary.

pub mod file;

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

/// One encoded frame with presentation timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkBuffer {
    /// Presentation time relative to the first frame
    pub pts: Duration,
    /// Nominal frame duration
    pub duration: Duration,
    /// Source sequence number
    pub offset: u64,
    /// Encoded payload, owned by the sink
    pub data: Bytes,
}

/// Result of handing a buffer to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowReturn {
    /// Accepted
    Ok,
    /// Queue full; the buffer was dropped
    Full,
    /// End of stream already sent; the buffer was dropped
    Eos,
    /// The sink is gone
    Error,
}

impl std::fmt::Display for FlowReturn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FlowReturn::Ok => "ok",
            FlowReturn::Full => "full",
            FlowReturn::Eos => "eos",
            FlowReturn::Error => "error",
        };
        f.write_str(name)
    }
}

/// Asynchronous notification from the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// The container is complete and safely closed
    Finalized,
    /// The sink failed; the container may be incomplete
    Error(String),
}

/// Receiving end of a sink's event channel
pub type SinkEvents = mpsc::UnboundedReceiver<SinkEvent>;

/// Streaming sink capability
///
/// Both methods are called from the video source's thread and must not
/// block on the sink's own progress.
pub trait StreamSink: Send + Sync {
    /// Hand one buffer to the sink
    fn push(&self, buffer: SinkBuffer) -> FlowReturn;

    /// Signal that no more buffers will follow
    fn end_of_stream(&self) -> FlowReturn;
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Recording sink for tests
    #[derive(Clone)]
    pub struct MockSink {
        pub pushed: Arc<Mutex<Vec<SinkBuffer>>>,
        pub flow: Arc<Mutex<FlowReturn>>,
        pub eos_count: Arc<Mutex<usize>>,
        /// Emit `Finalized` when end-of-stream is received
        pub finalize_on_eos: bool,
        events: mpsc::UnboundedSender<SinkEvent>,
    }

    impl MockSink {
        pub fn new(finalize_on_eos: bool) -> (Self, SinkEvents) {
            let (events, rx) = mpsc::unbounded_channel();
            let sink = Self {
                pushed: Arc::new(Mutex::new(Vec::new())),
                flow: Arc::new(Mutex::new(FlowReturn::Ok)),
                eos_count: Arc::new(Mutex::new(0)),
                finalize_on_eos,
                events,
            };
            (sink, rx)
        }

        pub fn set_flow(&self, flow: FlowReturn) {
            *self.flow.lock().unwrap() = flow;
        }

        pub fn pushed(&self) -> Vec<SinkBuffer> {
            self.pushed.lock().unwrap().clone()
        }

        pub fn eos_count(&self) -> usize {
            *self.eos_count.lock().unwrap()
        }

        pub fn emit(&self, event: SinkEvent) {
            let _ = self.events.send(event);
        }
    }

    impl StreamSink for MockSink {
        fn push(&self, buffer: SinkBuffer) -> FlowReturn {
            let flow = *self.flow.lock().unwrap();
            if flow == FlowReturn::Ok {
                self.pushed.lock().unwrap().push(buffer);
            }
            flow
        }

        fn end_of_stream(&self) -> FlowReturn {
            *self.eos_count.lock().unwrap() += 1;
            if self.finalize_on_eos {
                let _ = self.events.send(SinkEvent::Finalized);
            }
            FlowReturn::Ok
        }
    }
}
