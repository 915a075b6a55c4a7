//! # Capture Session
//!
//! Wires the pipeline together and runs the control loop.
//!
//! ```text
//! UDP ──▶ TelemetryReceiver ──▶ full-rate log
//!                 │
//!                 └──▶ Mailbox ◀── snapshot ──┐
//!                                             │
//! FrameSource ──▶ StreamFeeder ──▶ sink       └── correlated log
//! ```
//!
//! The control loop waits for an interrupt, the end of video input or a
//! sink error, and reports run statistics at a fixed interval. Teardown is
//! delegated to the [`ShutdownCoordinator`].

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::context::{CaptureContext, SessionPaths, StatsSnapshot};
use crate::error::Result;
use crate::notify::send_ready;
use crate::shutdown::{
    InterruptReason, Interrupter, ShutdownCoordinator, ShutdownReport, Teardown,
};
use crate::sink::{SinkEvent, SinkEvents, StreamSink};
use crate::telemetry::logger::TelemetryLogger;
use crate::telemetry::receiver::TelemetryReceiver;
use crate::video::feeder::StreamFeeder;
use crate::video::probe::LatencyProbe;
use crate::video::source::FrameSource;

/// A running recording
pub struct CaptureSession {
    ctx: Arc<CaptureContext>,
    coordinator: ShutdownCoordinator,
    teardown: Teardown,
    end_of_input: CancellationToken,
    telemetry_addr: SocketAddr,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("paths", &self.ctx.paths)
            .field("telemetry_addr", &self.telemetry_addr)
            .field("phase", &self.coordinator.phase())
            .finish_non_exhaustive()
    }
}

impl CaptureSession {
    /// Bind telemetry, open the logs and start the frame source
    ///
    /// `interrupter` may already be wired to signal handlers. An interrupt
    /// that lands while the session is starting leaves the frame source
    /// unstarted; [`run`](Self::run) then returns at once and
    /// [`shutdown`](Self::shutdown) finalizes the empty container.
    ///
    /// The readiness datagram is sent once the telemetry receiver is
    /// running; failing to send it is only logged.
    ///
    /// # Errors
    ///
    /// - `Bind`: telemetry socket unavailable
    /// - `Io`: a log file cannot be created
    /// - `Source`: the frame source cannot start (the partially started
    ///   pipeline is torn down first)
    pub async fn start(
        config: Config,
        paths: SessionPaths,
        interrupter: Interrupter,
        mut source: Box<dyn FrameSource>,
        sink: Arc<dyn StreamSink>,
        sink_events: SinkEvents,
    ) -> Result<Self> {
        let ctx = Arc::new(CaptureContext::with_cancel(config, paths, interrupter.token()));
        let coordinator =
            ShutdownCoordinator::new(interrupter, ctx.config.shutdown.finalize_timeout());

        let receiver = TelemetryReceiver::bind(Arc::clone(&ctx)).await?;
        let telemetry_addr = receiver.local_addr()?;

        let correlated = TelemetryLogger::create(
            &ctx.paths.correlated_log,
            ctx.config.telemetry.log_format,
        )?;
        let mut feeder = StreamFeeder::new(Arc::clone(&ctx), Arc::clone(&sink), correlated);
        if let Some(target) = ctx.config.video.latency_probe_socket_addr()? {
            feeder = feeder.with_probe(LatencyProbe::new(target)?);
        }
        let feeder = Arc::new(feeder);

        let mut session = Self {
            end_of_input: source.end_of_input(),
            teardown: Teardown {
                source: None,
                feeder: Some(Arc::clone(&feeder)),
                sink: Some(sink),
                sink_events: Some(sink_events),
                receiver: Some(receiver.spawn()),
                sink_failure: None,
            },
            ctx,
            coordinator,
            telemetry_addr,
        };

        if session.ctx.config.telemetry.notify_enabled {
            let target = session.ctx.config.telemetry.notify_socket_addr()?;
            if let Err(e) = send_ready(target).await {
                warn!("Failed to send ready notification to {}: {}", target, e);
            }
        }

        if session.ctx.cancel.is_cancelled() {
            warn!(
                "Interrupted during startup, not starting frame source {}",
                source.name()
            );
            return Ok(session);
        }

        if let Err(e) = source.start(feeder) {
            error!("Failed to start frame source {}: {}", source.name(), e);
            session.shutdown().await;
            return Err(e);
        }
        info!("Frame source {} started", source.name());
        session.teardown.source = Some(source);

        info!(
            "Recording to {} (telemetry on {})",
            session.ctx.paths.dir.display(),
            telemetry_addr
        );
        Ok(session)
    }

    /// Handle for ending the run from another task
    pub fn interrupter(&self) -> Interrupter {
        self.coordinator.interrupter().clone()
    }

    /// Shared run state
    pub fn context(&self) -> &Arc<CaptureContext> {
        &self.ctx
    }

    /// Address the telemetry socket is bound to
    pub fn telemetry_addr(&self) -> SocketAddr {
        self.telemetry_addr
    }

    /// Run until interrupted
    ///
    /// Returns the reason the run ended.
    pub async fn run(&mut self) -> Option<InterruptReason> {
        let interrupter = self.interrupter();
        let mut ticker = tokio::time::interval(self.ctx.config.status.report_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        let mut last = self.ctx.stats.snapshot();

        loop {
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => break,
                _ = self.end_of_input.cancelled() => {
                    interrupter.interrupt(InterruptReason::EndOfInput);
                }
                event = next_event(&mut self.teardown.sink_events) => {
                    let failure = match event {
                        Some(SinkEvent::Error(message)) => message,
                        Some(SinkEvent::Finalized) => "finalized before end of stream".to_string(),
                        None => {
                            self.teardown.sink_events = None;
                            "event channel closed".to_string()
                        }
                    };
                    error!("Sink failed during recording: {}", failure);
                    self.teardown.sink_failure = Some(failure);
                    interrupter.interrupt(InterruptReason::SinkError);
                }
                _ = ticker.tick() => {
                    let now = self.ctx.stats.snapshot();
                    report_status(&last, &now, self.ctx.config.status.report_interval_ms);
                    last = now;
                }
            }
        }

        interrupter.reason()
    }

    /// Drain, finalize and join; safe to call more than once
    pub async fn shutdown(&mut self) -> ShutdownReport {
        self.coordinator.shutdown(&self.ctx, &mut self.teardown).await
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        // Stops the receiver task if the session is dropped without shutdown
        self.ctx.cancel.cancel();
    }
}

async fn next_event(events: &mut Option<SinkEvents>) -> Option<SinkEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

fn report_status(last: &StatsSnapshot, now: &StatsSnapshot, interval_ms: u64) {
    let seconds = interval_ms as f64 / 1000.0;
    let rate = |current: u64, previous: u64| current.saturating_sub(previous) as f64 / seconds;

    info!(
        "Telemetry: {} packets ({:.1}/s), {} malformed | Video: {} frames ({:.1} fps), {} push failures | Correlated: {} rows, {} frames without telemetry",
        now.telemetry_packets,
        rate(now.telemetry_packets, last.telemetry_packets),
        now.malformed_packets,
        now.frames_pushed,
        rate(now.frames_pushed, last.frames_pushed),
        now.push_failures,
        now.correlated_rows,
        now.frames_without_telemetry
    );
}
