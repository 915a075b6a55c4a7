//! # Capture Sync
//!
//! Record a camera stream and motion-capture telemetry, correlated per frame.
//!
//! ```bash
//! capture-sync [config.toml]
//! ```
//!
//! Without an argument the built-in defaults are used: telemetry on
//! `0.0.0.0:5005`, length-prefixed video frames on stdin, output under
//! `./recordings`.

use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use capture_sync::config::{Config, LoggingConfig};
use capture_sync::context::SessionPaths;
use capture_sync::session::CaptureSession;
use capture_sync::shutdown::{install_signal_handlers, watch_stdin, Interrupter};
use capture_sync::sink::file::FileSink;
use capture_sync::video::source;

/// Prefix of the daily rolling log file
const LOG_FILE_PREFIX: &str = "capture-sync.log";

/// Main entry point for Capture Sync
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration and set up logging
///    - Install signal handlers, so an early signal still tears down cleanly
///    - Create the output directory and the container sink
///    - Bind telemetry, open both logs, start the frame source
///
/// 2. **Recording**
///    - Runs until SIGINT/SIGTERM, a line on stdin (if enabled), the end
///      of video input or a sink error
///
/// 3. **Shutdown**
///    - Stop the source, send end-of-stream, wait for the container to be
///      finalized, join the telemetry receiver
///
/// # Exit Status
///
/// `0` only when the container was finalized. Startup failures and
/// finalization failures exit non-zero.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("Failed to load {}", path))?,
        None => Config::default(),
    };

    let _log_guard = init_logging(&config.logging)?;
    info!("Capture Sync v{} starting...", env!("CARGO_PKG_VERSION"));

    let interrupter = Interrupter::default();
    let signals = install_signal_handlers(interrupter.clone())?;

    let paths = SessionPaths::for_now(&config);
    paths.ensure_dir()?;

    let (sink, sink_events) =
        FileSink::create(&paths.container, config.output.sink_queue_capacity).await?;
    let source = source::from_config(&config.video);
    let stop_on_stdin = config.shutdown.stop_on_stdin;

    let mut session = CaptureSession::start(
        config,
        paths,
        interrupter.clone(),
        source,
        Arc::new(sink),
        sink_events,
    )
    .await?;

    if stop_on_stdin {
        watch_stdin(interrupter);
        info!("Press Enter to stop recording");
    } else {
        info!("Press Ctrl+C to stop recording");
    }

    let reason = session.run().await;
    info!(
        "Recording stopped ({})",
        reason.map(|r| r.to_string()).unwrap_or_else(|| "unknown".to_string())
    );

    let report = session.shutdown().await;
    signals.abort();

    let paths = &session.context().paths;
    info!("Video: {}", paths.container.display());
    info!(
        "Full-rate telemetry: {} ({} rows)",
        paths.full_rate_log.display(),
        report
            .telemetry_records
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    info!(
        "Correlated telemetry: {} ({} rows)",
        paths.correlated_log.display(),
        report.correlated_records
    );

    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!("Recording ended without a finalized container: {}", report.finalize);
        Ok(ExitCode::FAILURE)
    }
}

/// Set up console logging and, if enabled, a daily rolling log file
///
/// Console output goes to stderr since stdin/stdout may carry video.
/// The returned guard must be kept alive for the file writer to flush.
fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let console = fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = if config.file_enabled {
        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("Failed to create log directory {}", config.dir))?;
        let appender = tracing_appender::rolling::daily(&config.dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_writer(writer).with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();

    if config.file_enabled {
        info!("Writing logs to {}", config.dir);
    }

    Ok(guard)
}
