//! # Telemetry Logger
//!
//! Append-only writer for telemetry rows.
//!
//! Two instances exist per run and each is owned by exactly one task:
//! - the full-rate log, written by the telemetry receiver (one row per packet)
//! - the correlated log, written by the stream feeder (one row per video frame)
//!
//! Appends are buffered; the owner decides when to [`flush`](TelemetryLogger::flush).
//! The file on disk is always a sequence of complete rows once flushed.

use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::packet::TelemetryPacket;
use crate::config::LogFormat;
use crate::error::Result;

/// JSONL row layout
#[derive(Serialize)]
struct JsonRecord<'a> {
    timestamp: &'a str,
    samples: &'a [f32],
}

/// Append-only telemetry log file
#[derive(Debug)]
pub struct TelemetryLogger {
    writer: BufWriter<File>,
    path: PathBuf,
    format: LogFormat,
    records: u64,
    header_written: bool,
}

impl TelemetryLogger {
    /// Create (or truncate) a log file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created
    pub fn create<P: AsRef<Path>>(path: P, format: LogFormat) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        debug!("Opened telemetry log {}", path.display());

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            format,
            records: 0,
            header_written: false,
        })
    }

    /// Append one row for `packet`
    ///
    /// In CSV format the first call also writes the header
    /// `timestamp,sample_0,...,sample_{n-1}`, sized from this packet.
    pub fn append(&mut self, packet: &TelemetryPacket) -> Result<()> {
        match self.format {
            LogFormat::Csv => {
                if !self.header_written {
                    let mut header = String::from("timestamp");
                    for i in 0..packet.samples.len() {
                        header.push_str(&format!(",sample_{}", i));
                    }
                    writeln!(self.writer, "{}", header)?;
                    self.header_written = true;
                }
                writeln!(self.writer, "{}", packet.to_csv_row())?;
            }
            LogFormat::Jsonl => {
                let record = JsonRecord {
                    timestamp: &packet.timestamp,
                    samples: &packet.samples,
                };
                serde_json::to_writer(&mut self.writer, &record)
                    .map_err(std::io::Error::from)?;
                self.writer.write_all(b"\n")?;
            }
        }

        self.records += 1;
        Ok(())
    }

    /// Flush buffered output to the file
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Number of rows appended so far (header excluded)
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A [`TelemetryLogger`] running on a blocking thread
///
/// Rows are queued without blocking the caller. The thread writes whatever
/// is queued, then flushes once per batch, so a burst of packets costs one
/// flush rather than one per row.
#[derive(Debug)]
pub struct LogWriter {
    rows: mpsc::UnboundedSender<TelemetryPacket>,
    join: JoinHandle<u64>,
}

impl LogWriter {
    /// Move `logger` onto a blocking thread
    pub fn spawn(mut logger: TelemetryLogger) -> Self {
        let (rows, mut queue) = mpsc::unbounded_channel::<TelemetryPacket>();

        let join = tokio::task::spawn_blocking(move || {
            while let Some(packet) = queue.blocking_recv() {
                write_row(&mut logger, &packet);
                while let Ok(packet) = queue.try_recv() {
                    write_row(&mut logger, &packet);
                }
                if let Err(e) = logger.flush() {
                    warn!("Failed to flush {}: {}", logger.path().display(), e);
                }
            }

            if let Err(e) = logger.flush() {
                warn!("Failed to flush {}: {}", logger.path().display(), e);
            }
            logger.records()
        });

        Self { rows, join }
    }

    /// Queue one row; `false` if the writer thread is gone
    pub fn send(&self, packet: TelemetryPacket) -> bool {
        self.rows.send(packet).is_ok()
    }

    /// Write out everything queued and return the number of rows
    pub async fn finish(self) -> u64 {
        let Self { rows, join } = self;
        drop(rows);

        match join.await {
            Ok(records) => records,
            Err(e) => {
                warn!("Telemetry log writer failed: {}", e);
                0
            }
        }
    }
}

fn write_row(logger: &mut TelemetryLogger, packet: &TelemetryPacket) {
    if let Err(e) = logger.append(packet) {
        warn!("Failed to write row to {}: {}", logger.path().display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn packet(ts: &str, samples: &[f32]) -> TelemetryPacket {
        TelemetryPacket {
            timestamp: ts.to_string(),
            samples: samples.to_vec(),
        }
    }

    #[test]
    fn test_csv_header_and_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.csv");
        let mut logger = TelemetryLogger::create(&path, LogFormat::Csv).unwrap();

        logger.append(&packet("t0", &[1.0, 2.0])).unwrap();
        logger.append(&packet("t1", &[3.0, 4.5])).unwrap();
        logger.flush().unwrap();
        assert_eq!(logger.records(), 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "timestamp,sample_0,sample_1",
                "t0,1.000000,2.000000",
                "t1,3.000000,4.500000",
            ]
        );
    }

    #[test]
    fn test_empty_log_has_no_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        let mut logger = TelemetryLogger::create(&path, LogFormat::Csv).unwrap();
        logger.flush().unwrap();

        assert_eq!(logger.records(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_rows_buffered_until_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.csv");
        let mut logger = TelemetryLogger::create(&path, LogFormat::Csv).unwrap();

        logger.append(&packet("t0", &[0.25])).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        logger.flush().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with("t0,0.250000\n"));
    }

    #[test]
    fn test_jsonl_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.jsonl");
        let mut logger = TelemetryLogger::create(&path, LogFormat::Jsonl).unwrap();

        logger.append(&packet("t0", &[1.5, -2.0])).unwrap();
        logger.append(&packet("t1", &[])).unwrap();
        logger.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["timestamp"], "t0");
        assert_eq!(rows[0]["samples"], serde_json::json!([1.5, -2.0]));
        assert_eq!(rows[1]["samples"], serde_json::json!([]));
    }

    #[test]
    fn test_create_in_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("full.csv");
        assert!(TelemetryLogger::create(&path, LogFormat::Csv).is_err());
    }

    #[test]
    fn test_path_accessor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.csv");
        let logger = TelemetryLogger::create(&path, LogFormat::Csv).unwrap();
        assert_eq!(logger.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_log_writer_writes_rows_off_thread() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.csv");
        let writer = LogWriter::spawn(TelemetryLogger::create(&path, LogFormat::Csv).unwrap());

        for i in 0..50 {
            assert!(writer.send(packet(&format!("t{:02}", i), &[i as f32])));
        }

        assert_eq!(writer.finish().await, 50);
        let contents = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = contents.lines().collect();
        assert_eq!(rows.len(), 51);
        assert_eq!(rows[0], "timestamp,sample_0");
        assert_eq!(rows[50], "t49,49.000000");
    }

    #[tokio::test]
    async fn test_log_writer_finish_without_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        let writer = LogWriter::spawn(TelemetryLogger::create(&path, LogFormat::Csv).unwrap());

        assert_eq!(writer.finish().await, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
