//! # Telemetry Packet Parser
//!
//! Parses one raw telemetry datagram.
//!
//! ## Wire Format
//!
//! ```text
//! ┌─────────────────────┬─────┬──────────────────────────────────────┐
//! │ timestamp (text)    │ ',' │ f32 little-endian × N                │
//! └─────────────────────┴─────┴──────────────────────────────────────┘
//! ```
//!
//! There is no length prefix for the float array: `N` is the remainder
//! length divided by four, and a trailing partial float is dropped.

use std::fmt::Write as _;

/// Maximum datagram size accepted on the telemetry channel
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Maximum number of timestamp bytes kept; longer timestamps are truncated
pub const MAX_TIMESTAMP_LEN: usize = 127;

/// Delimiter between the timestamp text and the packed samples
pub const TIMESTAMP_DELIMITER: u8 = b',';

/// Width of one packed sample in bytes
pub const SAMPLE_WIDTH: usize = std::mem::size_of::<f32>();

/// One parsed telemetry sample: a timestamp plus a float vector
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPacket {
    /// Advisory timestamp text as sent by the telemetry host
    pub timestamp: String,

    /// Packed samples in wire order
    pub samples: Vec<f32>,
}

impl TelemetryPacket {
    /// Render the packet as one CSV row (without line terminator)
    ///
    /// Every sample is written with six decimals, matching the columns
    /// `timestamp,sample_0,...,sample_{n-1}`.
    pub fn to_csv_row(&self) -> String {
        let mut row = String::with_capacity(self.timestamp.len() + self.samples.len() * 12);
        row.push_str(&self.timestamp);
        for sample in &self.samples {
            // Writing to a String cannot fail
            let _ = write!(row, ",{:.6}", sample);
        }
        row
    }
}

/// Parse one telemetry datagram
///
/// # Arguments
///
/// * `datagram` - Raw datagram bytes, exactly as received
///
/// # Returns
///
/// * `Option<TelemetryPacket>` - Parsed packet, or `None` if the datagram
///   has no delimiter or carries less than one full sample
///
/// # Examples
///
/// ```
/// use capture_sync::telemetry::packet::parse_packet;
///
/// let mut datagram = b"12:00:00.000,".to_vec();
/// datagram.extend_from_slice(&1.5f32.to_le_bytes());
///
/// let packet = parse_packet(&datagram).unwrap();
/// assert_eq!(packet.timestamp, "12:00:00.000");
/// assert_eq!(packet.samples, vec![1.5]);
///
/// assert!(parse_packet(b"no delimiter").is_none());
/// ```
pub fn parse_packet(datagram: &[u8]) -> Option<TelemetryPacket> {
    let comma = datagram.iter().position(|&b| b == TIMESTAMP_DELIMITER)?;

    let remainder = &datagram[comma + 1..];
    let sample_count = remainder.len() / SAMPLE_WIDTH;
    if sample_count == 0 {
        return None;
    }

    let ts_bytes = &datagram[..comma.min(MAX_TIMESTAMP_LEN)];
    let timestamp = String::from_utf8_lossy(ts_bytes).into_owned();

    let samples = remainder
        .chunks_exact(SAMPLE_WIDTH)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    Some(TelemetryPacket { timestamp, samples })
}

/// Build a datagram in the telemetry wire format
///
/// Inverse of [`parse_packet`]; used by tools and tests that emulate the
/// telemetry host.
pub fn encode_packet(timestamp: &str, samples: &[f32]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(timestamp.len() + 1 + samples.len() * SAMPLE_WIDTH);
    datagram.extend_from_slice(timestamp.as_bytes());
    datagram.push(TIMESTAMP_DELIMITER);
    for sample in samples {
        datagram.extend_from_slice(&sample.to_le_bytes());
    }
    datagram
}
