//! Readiness notification.
//!
//! One fire-and-forget UDP datagram sent at startup, once the telemetry
//! socket is bound, so the motion-capture bridge knows to start streaming.

use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::info;

use crate::error::Result;

/// Payload of the readiness datagram
pub const READY_TOKEN: &[u8] = b"READY";

/// Send [`READY_TOKEN`] to `target` from an ephemeral socket
///
/// No acknowledgment is awaited.
pub async fn send_ready(target: SocketAddr) -> Result<()> {
    let local: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };

    let socket = UdpSocket::bind(local).await?;
    socket.send_to(READY_TOKEN, target).await?;
    info!("Sent ready notification to {}", target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_ready() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        send_ready(listener.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 32];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), listener.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], READY_TOKEN);
    }
}
