//! # Shutdown Coordination
//!
//! Interrupt surface and the ordered teardown of a capture session.
//!
//! ```text
//! Armed ──interrupt──▶ Interrupted ──shutdown()──▶ Draining ──▶ Joined
//! ```
//!
//! Interrupts come from SIGINT/SIGTERM, a line on stdin, the frame source
//! running out of input, or a sink error. The first one wins; later ones
//! are logged and ignored.
//!
//! Teardown order:
//! 1. Stop the frame source and the feeder (no more frames or rows)
//! 2. Send end-of-stream into the sink
//! 3. Wait, bounded, for the sink to confirm finalization
//! 4. Stop and join the telemetry receiver

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{CaptureContext, StatsSnapshot};
use crate::error::{CaptureSyncError, Result};
use crate::sink::{FlowReturn, SinkEvent, SinkEvents, StreamSink};
use crate::telemetry::receiver::ReceiverHandle;
use crate::video::feeder::StreamFeeder;
use crate::video::source::FrameSource;

/// Coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownPhase {
    Armed = 0,
    Interrupted = 1,
    Draining = 2,
    Joined = 3,
}

impl ShutdownPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownPhase::Armed,
            1 => ShutdownPhase::Interrupted,
            2 => ShutdownPhase::Draining,
            _ => ShutdownPhase::Joined,
        }
    }
}

/// What ended the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// SIGINT or SIGTERM
    Signal,
    /// The frame source ran out of input
    EndOfInput,
    /// A line was entered on stdin
    StdinStop,
    /// The sink reported an error
    SinkError,
    /// Shutdown was called without a prior interrupt
    Requested,
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InterruptReason::Signal => "signal",
            InterruptReason::EndOfInput => "end of input",
            InterruptReason::StdinStop => "stdin stop",
            InterruptReason::SinkError => "sink error",
            InterruptReason::Requested => "requested",
        };
        f.write_str(text)
    }
}

#[derive(Debug)]
struct InterruptState {
    phase: AtomicU8,
    reason: Mutex<Option<InterruptReason>>,
}

/// Cloneable handle that ends the run
///
/// Cancelling the run token clears the run flag seen by the telemetry
/// receiver and wakes the control loop.
#[derive(Debug, Clone)]
pub struct Interrupter {
    cancel: CancellationToken,
    state: Arc<InterruptState>,
}

impl Interrupter {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            state: Arc::new(InterruptState {
                phase: AtomicU8::new(ShutdownPhase::Armed as u8),
                reason: Mutex::new(None),
            }),
        }
    }

    /// Request the end of the run
    ///
    /// Returns `true` for the first interrupt; repeats do nothing and
    /// return `false`.
    pub fn interrupt(&self, reason: InterruptReason) -> bool {
        let first = self
            .state
            .phase
            .compare_exchange(
                ShutdownPhase::Armed as u8,
                ShutdownPhase::Interrupted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if !first {
            debug!("Ignoring {} interrupt, already shutting down", reason);
            return false;
        }

        if let Ok(mut slot) = self.state.reason.lock() {
            *slot = Some(reason);
        }
        info!("Interrupted ({}), shutting down", reason);
        self.cancel.cancel();
        true
    }

    /// Run token cancelled by the first interrupt
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current phase
    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.state.phase.load(Ordering::Acquire))
    }

    /// Reason given by the first interrupt
    pub fn reason(&self) -> Option<InterruptReason> {
        self.state.reason.lock().ok().and_then(|slot| *slot)
    }

    /// Resolves once an interrupt has been requested
    pub async fn interrupted(&self) {
        self.cancel.cancelled().await;
    }

    fn advance(&self, phase: ShutdownPhase) {
        self.state.phase.fetch_max(phase as u8, Ordering::AcqRel);
    }
}

impl Default for Interrupter {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

/// Install SIGINT/SIGTERM handlers that interrupt the run
///
/// Handlers are registered before this returns so a signal arriving right
/// after startup is not lost. The listening task keeps running after the
/// first signal so repeats are absorbed instead of killing the process.
///
/// # Errors
///
/// Returns `Signal` error if a handler cannot be registered
#[cfg(unix)]
pub fn install_signal_handlers(interrupter: Interrupter) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).map_err(CaptureSyncError::Signal)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(CaptureSyncError::Signal)?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigint.recv() => "SIGINT",
                Some(()) = sigterm.recv() => "SIGTERM",
                else => break,
            };

            if !interrupter.interrupt(InterruptReason::Signal) {
                warn!("Received {} while shutting down, ignoring", name);
            }
        }
    }))
}

/// Install a Ctrl+C handler that interrupts the run
#[cfg(not(unix))]
pub fn install_signal_handlers(interrupter: Interrupter) -> Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Ctrl+C handler failed: {}", e);
                break;
            }
            if !interrupter.interrupt(InterruptReason::Signal) {
                warn!("Received Ctrl+C while shutting down, ignoring");
            }
        }
    }))
}

/// Interrupt the run when a line is entered on stdin
///
/// End of stdin is not treated as a stop request.
pub fn watch_stdin(interrupter: Interrupter) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(_)) => {
                    interrupter.interrupt(InterruptReason::StdinStop);
                }
                Ok(None) => debug!("stdin closed, keypress stop disabled"),
                Err(e) => warn!("Failed to read stdin: {}", e),
            },
            _ = interrupter.interrupted() => {}
        }
    })
}

/// How the sink's container ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The sink confirmed the container is complete
    Finalized,
    /// No confirmation within the bound; the container may be incomplete
    TimedOut,
    /// The sink failed or went away; the container may be incomplete
    Failed(String),
}

impl fmt::Display for FinalizeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalizeOutcome::Finalized => f.write_str("finalized"),
            FinalizeOutcome::TimedOut => f.write_str("timed out"),
            FinalizeOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Summary of a completed teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub reason: Option<InterruptReason>,
    pub finalize: FinalizeOutcome,
    /// Full-rate rows, `None` if the receiver could not be joined
    pub telemetry_records: Option<u64>,
    pub correlated_records: u64,
    pub stats: StatsSnapshot,
}

impl ShutdownReport {
    /// Whether the container can be considered valid
    pub fn is_clean(&self) -> bool {
        self.finalize == FinalizeOutcome::Finalized
    }
}

/// Pipeline parts released by the coordinator, in teardown order
///
/// Every field is optional so a partially started session can be torn
/// down with the same code.
#[derive(Default)]
pub struct Teardown {
    pub source: Option<Box<dyn FrameSource>>,
    pub feeder: Option<Arc<StreamFeeder>>,
    pub sink: Option<Arc<dyn StreamSink>>,
    pub sink_events: Option<SinkEvents>,
    pub receiver: Option<ReceiverHandle>,
    /// Error already reported by the sink during the run
    pub sink_failure: Option<String>,
}

/// Runs the drain/finalize/join sequence exactly once
#[derive(Debug)]
pub struct ShutdownCoordinator {
    interrupter: Interrupter,
    finalize_timeout: Duration,
    report: Option<ShutdownReport>,
}

impl ShutdownCoordinator {
    pub fn new(interrupter: Interrupter, finalize_timeout: Duration) -> Self {
        Self {
            interrupter,
            finalize_timeout,
            report: None,
        }
    }

    /// Handle for interrupting the run
    pub fn interrupter(&self) -> &Interrupter {
        &self.interrupter
    }

    /// Current phase
    pub fn phase(&self) -> ShutdownPhase {
        self.interrupter.phase()
    }

    /// Tear the pipeline down
    ///
    /// Calling this again returns the first report without touching the
    /// pipeline.
    pub async fn shutdown(
        &mut self,
        ctx: &CaptureContext,
        teardown: &mut Teardown,
    ) -> ShutdownReport {
        if let Some(report) = &self.report {
            debug!("Shutdown already completed");
            return report.clone();
        }

        self.interrupter.interrupt(InterruptReason::Requested);
        self.interrupter.advance(ShutdownPhase::Draining);
        info!("Draining pipeline");

        if let Some(mut source) = teardown.source.take() {
            debug!("Stopping frame source {}", source.name());
            source.stop();
        }

        let correlated_records = teardown
            .feeder
            .take()
            .map(|feeder| feeder.stop())
            .unwrap_or(0);

        let finalize = self.finalize_sink(teardown).await;
        match &finalize {
            FinalizeOutcome::Finalized => info!("Container finalized"),
            outcome => error!("Container not finalized ({}), it may be incomplete", outcome),
        }

        self.interrupter.advance(ShutdownPhase::Joined);
        let telemetry_records = match teardown.receiver.take() {
            Some(mut receiver) => {
                receiver.stop();
                receiver.join(self.finalize_timeout).await
            }
            None => None,
        };

        let report = ShutdownReport {
            reason: self.interrupter.reason(),
            finalize,
            telemetry_records,
            correlated_records,
            stats: ctx.stats.snapshot(),
        };
        info!("Shutdown complete: {:?}", report);

        self.report = Some(report.clone());
        report
    }

    async fn finalize_sink(&self, teardown: &mut Teardown) -> FinalizeOutcome {
        let Some(sink) = teardown.sink.take() else {
            return FinalizeOutcome::Failed("no sink".to_string());
        };

        if let Some(failure) = teardown.sink_failure.take() {
            sink.end_of_stream();
            return FinalizeOutcome::Failed(failure);
        }

        let flow = sink.end_of_stream();
        if flow != FlowReturn::Ok {
            warn!("End of stream returned {}", flow);
        }

        let Some(mut events) = teardown.sink_events.take() else {
            return FinalizeOutcome::Failed("sink events unavailable".to_string());
        };

        debug!("Waiting up to {:?} for finalization", self.finalize_timeout);
        let wait = async {
            match events.recv().await {
                Some(SinkEvent::Finalized) => FinalizeOutcome::Finalized,
                Some(SinkEvent::Error(message)) => FinalizeOutcome::Failed(message),
                None => FinalizeOutcome::Failed("sink closed without finalizing".to_string()),
            }
        };

        tokio::time::timeout(self.finalize_timeout, wait)
            .await
            .unwrap_or(FinalizeOutcome::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LogFormat};
    use crate::context::SessionPaths;
    use crate::sink::mocks::MockSink;
    use crate::telemetry::logger::TelemetryLogger;
    use crate::telemetry::receiver::{ReceiverState, TelemetryReceiver};
    use crate::video::frame::VideoFrame;
    use crate::video::source::mocks::MockSource;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Pipeline {
        _dir: TempDir,
        ctx: Arc<CaptureContext>,
        sink: MockSink,
        source: MockSource,
        teardown: Teardown,
    }

    async fn pipeline(finalize_on_eos: bool) -> Pipeline {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.telemetry.bind_addr = "127.0.0.1:0".to_string();
        let paths = SessionPaths::new(dir.path(), "test", "h264", LogFormat::Csv);
        let ctx = Arc::new(CaptureContext::new(config, paths));

        let receiver = TelemetryReceiver::bind(Arc::clone(&ctx)).await.unwrap().spawn();
        let (sink, events) = MockSink::new(finalize_on_eos);
        let sink_arc: Arc<dyn StreamSink> = Arc::new(sink.clone());
        let correlated =
            TelemetryLogger::create(&ctx.paths.correlated_log, LogFormat::Csv).unwrap();
        let feeder = Arc::new(StreamFeeder::new(
            Arc::clone(&ctx),
            Arc::clone(&sink_arc),
            correlated,
        ));

        let mut source = MockSource::new();
        let shared = source.clone();
        source.start(feeder.clone()).unwrap();

        Pipeline {
            _dir: dir,
            ctx,
            sink,
            source: shared,
            teardown: Teardown {
                source: Some(Box::new(source)),
                feeder: Some(feeder),
                sink: Some(sink_arc),
                sink_events: Some(events),
                receiver: Some(receiver),
                sink_failure: None,
            },
        }
    }

    #[test]
    fn test_first_interrupt_wins() {
        let token = CancellationToken::new();
        let interrupter = Interrupter::new(token.clone());
        assert_eq!(interrupter.phase(), ShutdownPhase::Armed);

        assert!(interrupter.interrupt(InterruptReason::Signal));
        assert!(token.is_cancelled());
        assert!(!interrupter.clone().interrupt(InterruptReason::EndOfInput));

        assert_eq!(interrupter.phase(), ShutdownPhase::Interrupted);
        assert_eq!(interrupter.reason(), Some(InterruptReason::Signal));
    }

    #[test]
    fn test_phase_never_moves_backwards() {
        let interrupter = Interrupter::new(CancellationToken::new());
        interrupter.advance(ShutdownPhase::Joined);
        interrupter.advance(ShutdownPhase::Draining);
        assert_eq!(interrupter.phase(), ShutdownPhase::Joined);
    }

    #[tokio::test]
    async fn test_shutdown_finalizes_and_joins() {
        let mut p = pipeline(true).await;
        p.source.emit(VideoFrame::new(0, Bytes::from_static(b"frame")));

        let interrupter = Interrupter::new(p.ctx.cancel.clone());
        interrupter.interrupt(InterruptReason::Signal);

        let mut coordinator = ShutdownCoordinator::new(interrupter, Duration::from_secs(2));
        let report = coordinator.shutdown(&p.ctx, &mut p.teardown).await;

        assert!(report.is_clean());
        assert_eq!(report.reason, Some(InterruptReason::Signal));
        assert_eq!(report.telemetry_records, Some(0));
        assert_eq!(report.stats.frames_pushed, 1);
        assert_eq!(coordinator.phase(), ShutdownPhase::Joined);
        assert_eq!(*p.source.stop_calls.lock().unwrap(), 1);
        assert_eq!(p.sink.eos_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut p = pipeline(true).await;
        let mut coordinator =
            ShutdownCoordinator::new(Interrupter::new(p.ctx.cancel.clone()), Duration::from_secs(2));

        let first = coordinator.shutdown(&p.ctx, &mut p.teardown).await;
        let second = coordinator.shutdown(&p.ctx, &mut p.teardown).await;

        assert_eq!(first, second);
        assert_eq!(first.reason, Some(InterruptReason::Requested));
        assert_eq!(p.sink.eos_count(), 1);
        assert_eq!(*p.source.stop_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_frames_after_drain() {
        let mut p = pipeline(true).await;
        let mut coordinator =
            ShutdownCoordinator::new(Interrupter::new(p.ctx.cancel.clone()), Duration::from_secs(2));
        coordinator.shutdown(&p.ctx, &mut p.teardown).await;

        p.source.emit(VideoFrame::new(1, Bytes::from_static(b"late")));
        assert!(p.sink.pushed().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_timeout() {
        let mut p = pipeline(false).await;
        let mut coordinator = ShutdownCoordinator::new(
            Interrupter::new(p.ctx.cancel.clone()),
            Duration::from_millis(50),
        );

        let report = coordinator.shutdown(&p.ctx, &mut p.teardown).await;
        assert_eq!(report.finalize, FinalizeOutcome::TimedOut);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_sink_error_event_fails_finalization() {
        let mut p = pipeline(false).await;
        p.sink.emit(SinkEvent::Error("disk full".to_string()));

        let mut coordinator =
            ShutdownCoordinator::new(Interrupter::new(p.ctx.cancel.clone()), Duration::from_secs(2));
        let report = coordinator.shutdown(&p.ctx, &mut p.teardown).await;

        assert_eq!(report.finalize, FinalizeOutcome::Failed("disk full".to_string()));
    }

    #[tokio::test]
    async fn test_recorded_sink_failure_skips_wait() {
        let mut p = pipeline(false).await;
        p.teardown.sink_failure = Some("write failed".to_string());

        // Would time out if the coordinator waited for the mock
        let mut coordinator = ShutdownCoordinator::new(
            Interrupter::new(p.ctx.cancel.clone()),
            Duration::from_secs(30),
        );
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.shutdown(&p.ctx, &mut p.teardown),
        )
        .await
        .unwrap();

        assert_eq!(report.finalize, FinalizeOutcome::Failed("write failed".to_string()));
        assert_eq!(p.sink.eos_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CaptureContext::new(
            Config::default(),
            SessionPaths::new(dir.path(), "t", "h264", LogFormat::Csv),
        );
        let mut coordinator =
            ShutdownCoordinator::new(Interrupter::new(ctx.cancel.clone()), Duration::from_secs(1));

        let report = coordinator.shutdown(&ctx, &mut Teardown::default()).await;
        assert!(!report.is_clean());
        assert_eq!(report.telemetry_records, None);
        assert_eq!(report.correlated_records, 0);
    }

    #[tokio::test]
    async fn test_receiver_stopped_on_interrupt() {
        let mut p = pipeline(true).await;
        let receiver = p.teardown.receiver.take().unwrap();

        p.ctx.cancel.cancel();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while receiver.state() != ReceiverState::Stopped {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
