//! One TCP stream per peer, framed as fixed-size Sphinx packets.
//!
//! Grounded on the reference `Connection`: connect-with-retry, send-with-
//! timeout, and a dumb "is this still usable" flag flipped by the first
//! failed send rather than any liveness probing. Because every Sphinx
//! packet is exactly `packet_len()` bytes, framing needs no length prefix:
//! both sides just read exactly that many bytes per message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::PeerId;

const CONNECT_RETRIES: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
const SEND_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum PeerLinkError {
    #[error("failed to connect to peer {peer_id} at {addr} after {attempts} attempts: {source}")]
    Connect { peer_id: PeerId, addr: String, attempts: u32, source: std::io::Error },
}

/// A single peer's framed TCP connection. Shared behind an `Arc` so both the
/// accept loop (reading) and the mixer (writing) can hold it concurrently.
pub struct PeerLink {
    peer_id: PeerId,
    addr: String,
    stream: Mutex<TcpStream>,
    packet_len: usize,
    active: AtomicBool,
}

impl PeerLink {
    /// Establishes an outbound connection, retrying a handful of times with
    /// a fixed delay the way the reference `Connection.create` does via its
    /// `@retry(tries=5, delay=1)` decorator.
    pub async fn connect(peer_id: PeerId, host: &str, port: u16, packet_len: usize) -> Result<Self, PeerLinkError> {
        let addr = format!("{host}:{port}");
        let mut last_err = None;
        for attempt in 1..=CONNECT_RETRIES {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    info!(peer_id, %addr, "connected to peer");
                    return Ok(Self {
                        peer_id,
                        addr,
                        stream: Mutex::new(stream),
                        packet_len,
                        active: AtomicBool::new(true),
                    });
                }
                Err(error) => {
                    warn!(peer_id, %addr, attempt, %error, "connect attempt failed");
                    last_err = Some(error);
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
        Err(PeerLinkError::Connect {
            peer_id,
            addr,
            attempts: CONNECT_RETRIES,
            source: last_err.expect("at least one attempt recorded"),
        })
    }

    /// Wraps an already-accepted inbound stream.
    pub fn from_accepted(peer_id: PeerId, addr: String, stream: TcpStream, packet_len: usize) -> Self {
        Self { peer_id, addr, stream: Mutex::new(stream), packet_len, active: AtomicBool::new(true) }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Sends exactly one frame. On any I/O error (including timeout) the
    /// link is marked inactive; callers should drop it and reconnect rather
    /// than retry the same link, matching `send_to_peer`'s close-on-failure.
    pub async fn send(&self, packet: &[u8]) -> bool {
        if packet.len() != self.packet_len {
            warn!(peer_id = self.peer_id, len = packet.len(), expected = self.packet_len, "refusing to send mis-sized frame");
            return false;
        }
        let mut stream = self.stream.lock().await;
        let result = timeout(SEND_TIMEOUT, stream.write_all(packet)).await;
        match result {
            Ok(Ok(())) => {
                debug!(peer_id = self.peer_id, bytes = packet.len(), "sent frame");
                true
            }
            Ok(Err(error)) => {
                warn!(peer_id = self.peer_id, %error, "send failed, marking link inactive");
                self.active.store(false, Ordering::Relaxed);
                false
            }
            Err(_) => {
                warn!(peer_id = self.peer_id, "send timed out, marking link inactive");
                self.active.store(false, Ordering::Relaxed);
                false
            }
        }
    }

    /// Reads exactly one frame, blocking until the peer sends one or the
    /// connection closes. Returns `None` on EOF or any read error, and
    /// marks the link inactive in that case.
    pub async fn recv_frame(&self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; self.packet_len];
        let mut stream = self.stream.lock().await;
        match stream.read_exact(&mut buf).await {
            Ok(_) => Some(buf),
            Err(error) => {
                warn!(peer_id = self.peer_id, %error, "read failed, marking link inactive");
                drop(stream);
                self.active.store(false, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn close(&self) {
        let mut stream = self.stream.lock().await;
        let _ = stream.shutdown().await;
        self.active.store(false, Ordering::Relaxed);
        info!(peer_id = self.peer_id, addr = %self.addr, "closed peer link");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_and_frame_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            PeerLink::from_accepted(1, peer_addr.to_string(), stream, 16)
        });

        let client = PeerLink::connect(2, "127.0.0.1", addr.port(), 16).await.unwrap();
        let server = accept.await.unwrap();

        assert!(client.send(&[7u8; 16]).await);
        let received = server.recv_frame().await.unwrap();
        assert_eq!(received, vec![7u8; 16]);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            PeerLink::from_accepted(1, peer_addr.to_string(), stream, 16)
        });
        let client = PeerLink::connect(2, "127.0.0.1", addr.port(), 16).await.unwrap();
        let _server = accept.await.unwrap();
        assert!(!client.send(&[0u8; 8]).await);
    }
}
