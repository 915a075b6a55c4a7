//! # Telemetry Receiver
//!
//! Task that owns the telemetry socket and the full-rate log.
//!
//! For every datagram:
//! 1. Parse it ([`parse_packet`])
//! 2. Drop it if malformed (counted, never logged or published)
//! 3. Queue one row for the full-rate log
//! 4. Publish the raw datagram into the [`Mailbox`](super::mailbox::Mailbox)
//!
//! File writes happen on a [`LogWriter`] thread, never on the runtime.
//! The pending receive is abandoned as soon as the run token is cancelled;
//! the socket is dropped with the task, which closes its read side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::logger::{LogWriter, TelemetryLogger};
use super::packet::{parse_packet, MAX_DATAGRAM_SIZE};
use super::socket::DatagramSocket;
use crate::context::{CaptureContext, Stats};
use crate::error::{CaptureSyncError, Result};

/// Lifecycle of the receiver task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReceiverState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl ReceiverState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ReceiverState::Running,
            2 => ReceiverState::Draining,
            3 => ReceiverState::Stopped,
            _ => ReceiverState::Idle,
        }
    }
}

/// Shared view of the receiver state
#[derive(Debug)]
pub struct ReceiverStatus(AtomicU8);

impl ReceiverStatus {
    fn new() -> Self {
        Self(AtomicU8::new(ReceiverState::Idle as u8))
    }

    /// Current state
    pub fn get(&self) -> ReceiverState {
        ReceiverState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ReceiverState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Bounded exponential backoff for transient receive errors
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next retry; doubles up to the bound
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Start over after a successful receive
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Telemetry receiver, ready to be spawned
pub struct TelemetryReceiver {
    socket: Box<dyn DatagramSocket>,
    logger: TelemetryLogger,
    ctx: Arc<CaptureContext>,
    backoff: Backoff,
    cancel: CancellationToken,
    status: Arc<ReceiverStatus>,
}

impl std::fmt::Debug for TelemetryReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryReceiver")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("log", &self.logger.path())
            .finish_non_exhaustive()
    }
}

impl TelemetryReceiver {
    /// Bind the telemetry socket and create the full-rate log
    ///
    /// Both failures are fatal at startup: without the socket there is no
    /// telemetry and without the log there is nothing to persist it to.
    ///
    /// # Errors
    ///
    /// - `Bind`: the configured address cannot be bound
    /// - `Io`: the full-rate log cannot be created
    pub async fn bind(ctx: Arc<CaptureContext>) -> Result<Self> {
        let addr = ctx.config.telemetry.bind_socket_addr()?;
        let socket = UdpSocket::bind(addr).await.map_err(|source| CaptureSyncError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!("Telemetry socket bound on {}", socket.local_addr()?);

        let logger = TelemetryLogger::create(
            &ctx.paths.full_rate_log,
            ctx.config.telemetry.log_format,
        )?;

        Ok(Self::from_parts(socket, logger, ctx))
    }

    /// Build a receiver from an already bound socket and an open log
    pub fn from_parts(
        socket: impl DatagramSocket + 'static,
        logger: TelemetryLogger,
        ctx: Arc<CaptureContext>,
    ) -> Self {
        let backoff = Backoff::new(
            ctx.config.telemetry.backoff_initial(),
            ctx.config.telemetry.backoff_max(),
        );
        // Child token: cancelled on interrupt, or on its own during teardown
        let cancel = ctx.cancel.child_token();

        Self {
            socket: Box::new(socket),
            logger,
            ctx,
            backoff,
            cancel,
            status: Arc::new(ReceiverStatus::new()),
        }
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawn the receive loop on the runtime
    pub fn spawn(self) -> ReceiverHandle {
        let cancel = self.cancel.clone();
        let status = Arc::clone(&self.status);
        let join = tokio::spawn(self.run());

        ReceiverHandle {
            join: Some(join),
            cancel,
            status,
        }
    }

    /// Receive loop; returns the number of rows written to the full-rate log
    pub async fn run(self) -> u64 {
        let Self {
            mut socket,
            logger,
            ctx,
            mut backoff,
            cancel,
            status,
        } = self;

        let path = logger.path().to_path_buf();
        let rows = LogWriter::spawn(logger);
        status.set(ReceiverState::Running);
        debug!("Telemetry receiver running");

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => result,
            };

            match result {
                Ok((len, _peer)) => {
                    backoff.reset();
                    handle_datagram(&ctx, &rows, &buf[..len]);
                }
                Err(e) => {
                    let errors = Stats::bump(&ctx.stats.receive_errors);
                    let delay = backoff.next_delay();
                    warn!(
                        "Telemetry receive error ({} so far): {}, retrying in {:?}",
                        errors, e, delay
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        status.set(ReceiverState::Draining);
        let records = rows.finish().await;
        info!(
            "Telemetry receiver stopped: {} rows in {}",
            records,
            path.display()
        );

        status.set(ReceiverState::Stopped);
        records
    }
}

/// Process one datagram; returns `true` if it was a valid packet
fn handle_datagram(ctx: &CaptureContext, rows: &LogWriter, datagram: &[u8]) -> bool {
    let Some(packet) = parse_packet(datagram) else {
        let dropped = Stats::bump(&ctx.stats.malformed_packets);
        trace!(
            "Dropped malformed telemetry datagram ({} bytes, {} dropped so far)",
            datagram.len(),
            dropped
        );
        return false;
    };

    if !rows.send(packet) {
        warn!("Full-rate log writer stopped, row dropped");
    }
    ctx.mailbox.publish(datagram);
    Stats::bump(&ctx.stats.telemetry_packets);
    true
}

/// Handle to a spawned receiver
#[derive(Debug)]
pub struct ReceiverHandle {
    join: Option<JoinHandle<u64>>,
    cancel: CancellationToken,
    status: Arc<ReceiverStatus>,
}

impl ReceiverHandle {
    /// Current receiver state
    pub fn state(&self) -> ReceiverState {
        self.status.get()
    }

    /// Ask the receiver to stop; abandons any pending receive
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the receiver to finish, bounded by `timeout`
    ///
    /// Returns the number of full-rate rows, or `None` if the task did not
    /// finish in time or was already joined. A task that misses the bound
    /// is aborted.
    pub async fn join(&mut self, timeout: Duration) -> Option<u64> {
        let mut join = self.join.take()?;

        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(records)) => Some(records),
            Ok(Err(e)) => {
                warn!("Telemetry receiver task failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Telemetry receiver did not stop within {:?}, aborting", timeout);
                join.abort();
                None
            }
        }
    }
}
