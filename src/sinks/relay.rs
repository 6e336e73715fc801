//! Relay sink for external collaborators (Bluetooth, TCP, ...).
//!
//! The relay is just another registered sink: newline-delimited JSON
//! frames over any `AsyncRead + AsyncWrite` transport. The transport
//! itself (an RFCOMM socket, a TCP stream, a test duplex) is the
//! collaborator's business, as is pairing; the core's entire security
//! involvement is checking the peer's pre-shared PIN during the
//! handshake.
//!
//! Wire protocol (one JSON object per line):
//!
//! - peer → core: `{"type": "handshake", "pin": "<pin>", ...}`
//! - core → peer: `{"type": "handshake", "device_name": "<name>"}`
//!   followed by `{"type": "frame", "frame": {...}}` per dispatched frame
//!
//! A transport error is fatal for the sink; the dispatcher unregisters it
//! and the pipeline carries on.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::SinkError;
use crate::sink::FrameSink;
use crate::types::Frame;

/// Longest handshake line we will read before giving up.
const MAX_HANDSHAKE_LINE: usize = 4096;

/// JSON-over-stream relay sink.
#[derive(Debug)]
pub struct RelaySink<T> {
    transport: Mutex<T>,
    peer_name: String,
}

impl<T> RelaySink<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the PIN handshake and wrap the transport.
    ///
    /// Reads the peer's handshake line, verifies the pre-shared PIN, and
    /// answers with this device's handshake. Returns
    /// [`SinkError::HandshakeRejected`] on a PIN mismatch.
    pub async fn handshake(
        mut transport: T,
        device_name: &str,
        pin: &str,
    ) -> Result<Self, SinkError> {
        let line = read_line(&mut transport).await?;
        let hello: serde_json::Value = serde_json::from_slice(&line)
            .map_err(|_| SinkError::HandshakeRejected)?;

        if hello["type"] != "handshake" || hello["pin"] != pin {
            return Err(SinkError::HandshakeRejected);
        }
        let peer_name =
            hello["device_name"].as_str().unwrap_or("unknown").to_string();

        let reply = json!({"type": "handshake", "device_name": device_name});
        let mut reply_line = reply.to_string();
        reply_line.push('\n');
        transport
            .write_all(reply_line.as_bytes())
            .await
            .map_err(|source| SinkError::TransportLost { source })?;

        info!(peer = %peer_name, "relay handshake completed");
        Ok(Self { transport: Mutex::new(transport), peer_name })
    }

    /// Name the peer reported during the handshake.
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }
}

async fn read_line<T: AsyncRead + Unpin>(transport: &mut T) -> Result<Vec<u8>, SinkError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = transport
            .read(&mut byte)
            .await
            .map_err(|source| SinkError::TransportLost { source })?;
        if n == 0 {
            return Err(SinkError::TransportLost {
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed during handshake",
                ),
            });
        }
        if byte[0] == b'\n' {
            return Ok(line);
        }
        line.push(byte[0]);
        if line.len() > MAX_HANDSHAKE_LINE {
            return Err(SinkError::HandshakeRejected);
        }
    }
}

#[async_trait]
impl<T> FrameSink for RelaySink<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn accept(&self, frame: &Arc<Frame>) -> Result<(), SinkError> {
        let mut message = json!({"type": "frame", "frame": &**frame}).to_string();
        message.push('\n');

        let mut transport = self.transport.lock().await;
        transport
            .write_all(message.as_bytes())
            .await
            .map_err(|source| SinkError::TransportLost { source })?;
        debug!(peer = %self.peer_name, sequence = frame.sequence, "frame relayed");
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut transport = self.transport.lock().await;
        transport.flush().await.map_err(|source| SinkError::TransportLost { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::io::{AsyncBufReadExt, BufReader};

    use crate::types::{CanId, ChannelId, Direction, FrameFlags};

    fn frame(sequence: u64) -> Arc<Frame> {
        Arc::new(Frame {
            channel: ChannelId(0),
            id: CanId::Standard(0x351),
            payload: vec![0xDE, 0xAD],
            direction: Direction::Rx,
            flags: FrameFlags::default(),
            wall_clock: Utc::now(),
            monotonic_ns: 42,
            sequence,
            dropped: 0,
        })
    }

    #[tokio::test]
    async fn handshake_then_frames_flow() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let mut peer = BufReader::new(theirs);

        // Peer opens with the configured PIN
        peer.get_mut()
            .write_all(b"{\"type\":\"handshake\",\"pin\":\"1234\",\"device_name\":\"phone\"}\n")
            .await
            .unwrap();

        let sink = RelaySink::handshake(ours, "canflow", "1234").await.unwrap();
        assert_eq!(sink.peer_name(), "phone");

        // Our handshake reply arrives first
        let mut line = String::new();
        peer.read_line(&mut line).await.unwrap();
        let reply: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["type"], "handshake");
        assert_eq!(reply["device_name"], "canflow");

        sink.accept(&frame(7)).await.unwrap();

        line.clear();
        peer.read_line(&mut line).await.unwrap();
        let message: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(message["type"], "frame");
        assert_eq!(message["frame"]["sequence"], 7);
        assert_eq!(message["frame"]["payload"], serde_json::json!([0xDE, 0xAD]));
    }

    #[tokio::test]
    async fn wrong_pin_is_rejected() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let mut peer = theirs;

        peer.write_all(b"{\"type\":\"handshake\",\"pin\":\"0000\"}\n").await.unwrap();

        let err = RelaySink::handshake(ours, "canflow", "1234").await.unwrap_err();
        assert!(matches!(err, SinkError::HandshakeRejected));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn closed_transport_is_fatal() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let mut peer = theirs;
        peer.write_all(b"{\"type\":\"handshake\",\"pin\":\"1234\"}\n").await.unwrap();

        let sink = RelaySink::handshake(ours, "canflow", "1234").await.unwrap();
        drop(peer);

        // The duplex buffer soaks up writes until it fills; a closed peer
        // surfaces as a transport error on some subsequent accept
        let mut saw_fatal = false;
        for seq in 0..1024 {
            match sink.accept(&frame(seq)).await {
                Ok(()) => continue,
                Err(err) => {
                    assert!(err.is_fatal());
                    saw_fatal = true;
                    break;
                }
            }
        }
        assert!(saw_fatal, "expected a transport error after peer close");
    }
}
