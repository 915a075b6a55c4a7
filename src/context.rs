//! # Capture Context
//!
//! State shared by the telemetry receiver, the stream feeder and the
//! shutdown coordinator. Built once per run and passed around as
//! `Arc<CaptureContext>`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, LogFormat};
use crate::error::Result;
use crate::telemetry::mailbox::Mailbox;

/// Format of the file name suffix (local time at startup)
pub const SESSION_SUFFIX_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Output file locations for one recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    /// Output directory
    pub dir: PathBuf,
    /// Video container written by the sink
    pub container: PathBuf,
    /// One row per telemetry packet
    pub full_rate_log: PathBuf,
    /// One row per video frame
    pub correlated_log: PathBuf,
}

impl SessionPaths {
    /// Build paths in `dir` with the given file name suffix
    ///
    /// # Examples
    ///
    /// ```
    /// use capture_sync::config::LogFormat;
    /// use capture_sync::context::SessionPaths;
    ///
    /// let paths = SessionPaths::new("out", "20240501_100000", "h264", LogFormat::Csv);
    /// assert!(paths.container.ends_with("video_20240501_100000.h264"));
    /// assert!(paths.full_rate_log.ends_with("telemetry_full_20240501_100000.csv"));
    /// ```
    pub fn new<P: AsRef<Path>>(
        dir: P,
        suffix: &str,
        container_extension: &str,
        log_format: LogFormat,
    ) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let log_ext = log_format.extension();

        Self {
            container: dir.join(format!("video_{}.{}", suffix, container_extension)),
            full_rate_log: dir.join(format!("telemetry_full_{}.{}", suffix, log_ext)),
            correlated_log: dir.join(format!("telemetry_per_frame_{}.{}", suffix, log_ext)),
            dir,
        }
    }

    /// Build paths from configuration, suffixed with the current local time
    pub fn for_now(config: &Config) -> Self {
        let suffix = chrono::Local::now().format(SESSION_SUFFIX_FORMAT).to_string();
        Self::new(
            &config.output.dir,
            &suffix,
            &config.output.container_extension,
            config.telemetry.log_format,
        )
    }

    /// Create the output directory if needed
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}

/// Run counters, updated lock-free by the worker threads
#[derive(Debug, Default)]
pub struct Stats {
    pub telemetry_packets: AtomicU64,
    pub malformed_packets: AtomicU64,
    pub receive_errors: AtomicU64,
    pub frames_pushed: AtomicU64,
    pub push_failures: AtomicU64,
    pub correlated_rows: AtomicU64,
    pub frames_without_telemetry: AtomicU64,
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub telemetry_packets: u64,
    pub malformed_packets: u64,
    pub receive_errors: u64,
    pub frames_pushed: u64,
    pub push_failures: u64,
    pub correlated_rows: u64,
    pub frames_without_telemetry: u64,
}

impl Stats {
    /// Increment a counter by one and return the new value
    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Read all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            telemetry_packets: self.telemetry_packets.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
            correlated_rows: self.correlated_rows.load(Ordering::Relaxed),
            frames_without_telemetry: self.frames_without_telemetry.load(Ordering::Relaxed),
        }
    }
}

/// Shared run state
#[derive(Debug)]
pub struct CaptureContext {
    pub config: Config,
    pub paths: SessionPaths,
    pub mailbox: Mailbox,
    pub stats: Stats,
    /// Run flag for every worker; cancelled once on interrupt
    pub cancel: CancellationToken,
}

impl CaptureContext {
    pub fn new(config: Config, paths: SessionPaths) -> Self {
        Self::with_cancel(config, paths, CancellationToken::new())
    }

    /// Share a run flag created before the context, e.g. by signal handlers
    pub fn with_cancel(config: Config, paths: SessionPaths, cancel: CancellationToken) -> Self {
        Self {
            config,
            paths,
            mailbox: Mailbox::new(),
            stats: Stats::default(),
            cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_paths_csv() {
        let paths = SessionPaths::new("/data", "20240501_101500", "h264", LogFormat::Csv);
        assert_eq!(paths.dir, PathBuf::from("/data"));
        assert_eq!(paths.container, PathBuf::from("/data/video_20240501_101500.h264"));
        assert_eq!(
            paths.full_rate_log,
            PathBuf::from("/data/telemetry_full_20240501_101500.csv")
        );
        assert_eq!(
            paths.correlated_log,
            PathBuf::from("/data/telemetry_per_frame_20240501_101500.csv")
        );
    }

    #[test]
    fn test_session_paths_jsonl() {
        let paths = SessionPaths::new("out", "s", "mkv", LogFormat::Jsonl);
        assert!(paths.container.ends_with("video_s.mkv"));
        assert!(paths.full_rate_log.ends_with("telemetry_full_s.jsonl"));
        assert!(paths.correlated_log.ends_with("telemetry_per_frame_s.jsonl"));
    }

    #[test]
    fn test_session_paths_for_now_uses_config() {
        let mut config = Config::default();
        config.output.dir = "/tmp/rec".to_string();
        let paths = SessionPaths::for_now(&config);

        assert_eq!(paths.dir, PathBuf::from("/tmp/rec"));
        let name = paths.container.file_name().unwrap().to_string_lossy().to_string();
        // video_YYYYmmdd_HHMMSS.h264
        assert!(name.starts_with("video_"));
        assert!(name.ends_with(".h264"));
        assert_eq!(name.len(), "video_".len() + 15 + ".h264".len());
    }

    #[test]
    fn test_ensure_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SessionPaths::new(tmp.path().join("a/b"), "s", "h264", LogFormat::Csv);
        paths.ensure_dir().unwrap();
        assert!(paths.dir.is_dir());
    }

    #[test]
    fn test_stats_bump_and_snapshot() {
        let stats = Stats::default();
        assert_eq!(Stats::bump(&stats.frames_pushed), 1);
        assert_eq!(Stats::bump(&stats.frames_pushed), 2);
        Stats::bump(&stats.malformed_packets);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_pushed, 2);
        assert_eq!(snapshot.malformed_packets, 1);
        assert_eq!(snapshot.telemetry_packets, 0);
    }

    #[test]
    fn test_context_shares_run_flag() {
        let cancel = CancellationToken::new();
        let ctx = CaptureContext::with_cancel(
            Config::default(),
            SessionPaths::new("out", "s", "h264", LogFormat::Csv),
            cancel.clone(),
        );
        assert!(!ctx.cancel.is_cancelled());
        cancel.cancel();
        assert!(ctx.cancel.is_cancelled());
    }
}
