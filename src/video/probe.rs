//! # Latency Probe
//!
//! Optional per-frame UDP datagram carrying the capture timestamp, so an
//! external tool can measure glass-to-display latency.
//!
//! Payload: 8 bytes, little-endian `u64`, microseconds since the Unix epoch
//! at frame arrival. Sends are fire-and-forget.

use std::net::{SocketAddr, UdpSocket};
use tracing::{debug, info};

use crate::error::Result;

/// Size of one probe datagram
pub const PROBE_DATAGRAM_SIZE: usize = 8;

/// Per-frame timestamp sender
#[derive(Debug)]
pub struct LatencyProbe {
    socket: UdpSocket,
    target: SocketAddr,
}

impl LatencyProbe {
    /// Open an ephemeral socket of the target's address family
    pub fn new(target: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        info!("Latency probe sending to {}", target);

        Ok(Self { socket, target })
    }

    /// Send one timestamp; failures are ignored
    pub fn send(&self, capture_us: u64) {
        if let Err(e) = self.socket.send_to(&capture_us.to_le_bytes(), self.target) {
            debug!("Latency probe send failed: {}", e);
        }
    }
}

/// Current wall-clock time in microseconds since the Unix epoch
pub fn now_micros() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0)
}
