//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and every field is optional; an empty file yields the same
//! configuration as [`Config::default`].

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{CaptureSyncError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

/// Row format of the telemetry logs
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `timestamp,v0,v1,...` with six decimals per value
    #[default]
    Csv,
    /// One JSON object per line: `{"timestamp": ..., "samples": [...]}`
    Jsonl,
}

impl LogFormat {
    /// File extension used for logs written in this format
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Csv => "csv",
            LogFormat::Jsonl => "jsonl",
        }
    }
}

/// Where video frames come from
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Length-prefixed frames read from a file or stdin
    #[default]
    Reader,
    /// Generated frames at the nominal rate (bench and dry runs)
    Synthetic,
}

/// Telemetry ingress configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_notify_enabled")]
    pub notify_enabled: bool,

    #[serde(default = "default_notify_addr")]
    pub notify_addr: String,

    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Video source configuration
#[derive(Debug, Deserialize, Clone)]
pub struct VideoConfig {
    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default)]
    pub source: SourceKind,

    #[serde(default = "default_input_path")]
    pub input_path: String,

    #[serde(default = "default_synthetic_frame_bytes")]
    pub synthetic_frame_bytes: usize,

    /// Number of synthetic frames to emit before ending input (0 = unlimited)
    #[serde(default)]
    pub synthetic_frame_limit: u64,

    /// Per-frame latency probe target; empty disables the probe
    #[serde(default)]
    pub latency_probe_addr: String,
}

/// Persisted output configuration
#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: String,

    #[serde(default = "default_container_extension")]
    pub container_extension: String,

    #[serde(default = "default_sink_queue_capacity")]
    pub sink_queue_capacity: usize,
}

/// Shutdown configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    #[serde(default = "default_finalize_timeout_ms")]
    pub finalize_timeout_ms: u64,

    #[serde(default)]
    pub stop_on_stdin: bool,
}

/// Process log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub file_enabled: bool,

    #[serde(default = "default_log_dir")]
    pub dir: String,
}

/// Periodic status report configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

// Default value functions
fn default_bind_addr() -> String { "0.0.0.0:5005".to_string() }
fn default_notify_enabled() -> bool { true }
fn default_notify_addr() -> String { "127.0.0.1:5006".to_string() }
fn default_backoff_initial_ms() -> u64 { 1 }
fn default_backoff_max_ms() -> u64 { 200 }

fn default_fps() -> u32 { 30 }
fn default_input_path() -> String { "-".to_string() }
fn default_synthetic_frame_bytes() -> usize { 4096 }

fn default_output_dir() -> String { "./recordings".to_string() }
fn default_container_extension() -> String { "h264".to_string() }
fn default_sink_queue_capacity() -> usize { 8 }

fn default_finalize_timeout_ms() -> u64 { 5000 }

fn default_log_dir() -> String { "./logs".to_string() }

fn default_report_interval_ms() -> u64 { 2000 }

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            notify_enabled: default_notify_enabled(),
            notify_addr: default_notify_addr(),
            log_format: LogFormat::default(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            source: SourceKind::default(),
            input_path: default_input_path(),
            synthetic_frame_bytes: default_synthetic_frame_bytes(),
            synthetic_frame_limit: 0,
            latency_probe_addr: String::new(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            container_extension: default_container_extension(),
            sink_queue_capacity: default_sink_queue_capacity(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            finalize_timeout_ms: default_finalize_timeout_ms(),
            stop_on_stdin: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_enabled: false,
            dir: default_log_dir(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

impl TelemetryConfig {
    /// Parsed telemetry bind address
    pub fn bind_socket_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.bind_addr)
    }

    /// Parsed readiness notification target
    pub fn notify_socket_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.notify_addr)
    }

    /// First receive-error backoff delay
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    /// Upper bound of the receive-error backoff delay
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl VideoConfig {
    /// Nominal duration of one frame at the configured rate
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.fps.max(1)))
    }

    /// Parsed latency probe target, `None` when the probe is disabled
    pub fn latency_probe_socket_addr(&self) -> Result<Option<SocketAddr>> {
        if self.latency_probe_addr.is_empty() {
            return Ok(None);
        }
        parse_addr(&self.latency_probe_addr).map(Some)
    }
}

impl ShutdownConfig {
    /// Bound on the wait for sink finalization and receiver join
    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }
}

impl StatusConfig {
    /// Interval between status reports
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse::<SocketAddr>()
        .map_err(|e| CaptureSyncError::InvalidAddress(format!("{}: {}", addr, e)))
}

fn invalid(msg: impl std::fmt::Display) -> CaptureSyncError {
    CaptureSyncError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use capture_sync::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Addresses must parse up front so startup fails before any task runs
        if self.telemetry.bind_socket_addr().is_err() {
            return Err(invalid(format!(
                "telemetry bind_addr '{}' is not a socket address",
                self.telemetry.bind_addr
            )));
        }

        if self.telemetry.notify_enabled && self.telemetry.notify_socket_addr().is_err() {
            return Err(invalid(format!(
                "telemetry notify_addr '{}' is not a socket address",
                self.telemetry.notify_addr
            )));
        }

        if self.video.latency_probe_socket_addr().is_err() {
            return Err(invalid(format!(
                "video latency_probe_addr '{}' is not a socket address",
                self.video.latency_probe_addr
            )));
        }

        if self.telemetry.backoff_initial_ms == 0 || self.telemetry.backoff_initial_ms > 1000 {
            return Err(invalid("backoff_initial_ms must be between 1 and 1000"));
        }

        if self.telemetry.backoff_max_ms < self.telemetry.backoff_initial_ms
            || self.telemetry.backoff_max_ms > 10000
        {
            return Err(invalid(
                "backoff_max_ms must be between backoff_initial_ms and 10000",
            ));
        }

        if self.video.fps == 0 || self.video.fps > 240 {
            return Err(invalid("fps must be between 1 and 240"));
        }

        if self.video.source == SourceKind::Reader && self.video.input_path.is_empty() {
            return Err(invalid("input_path cannot be empty for the reader source"));
        }

        if self.shutdown.stop_on_stdin
            && self.video.source == SourceKind::Reader
            && self.video.input_path == "-"
        {
            return Err(invalid(
                "stop_on_stdin cannot be used while video is read from stdin",
            ));
        }

        if self.video.synthetic_frame_bytes == 0 {
            return Err(invalid("synthetic_frame_bytes must be greater than 0"));
        }

        if self.output.dir.is_empty() {
            return Err(invalid("output dir cannot be empty"));
        }

        if self.output.container_extension.is_empty() {
            return Err(invalid("container_extension cannot be empty"));
        }

        if self.output.sink_queue_capacity == 0 {
            return Err(invalid("sink_queue_capacity must be greater than 0"));
        }

        if self.shutdown.finalize_timeout_ms == 0 || self.shutdown.finalize_timeout_ms > 600_000 {
            return Err(invalid("finalize_timeout_ms must be between 1 and 600000"));
        }

        if self.logging.file_enabled && self.logging.dir.is_empty() {
            return Err(invalid("logging dir cannot be empty when file logging is enabled"));
        }

        if self.status.report_interval_ms == 0 || self.status.report_interval_ms > 60000 {
            return Err(invalid("report_interval_ms must be between 1 and 60000"));
        }

        Ok(())
    }
}
