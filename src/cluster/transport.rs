use crate::cluster::wire::Message;
use crate::error::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Unreliable datagram channel for cluster messages.
///
/// Send is fire-and-forget; receive blocks with an explicit timeout. Frames
/// that fail to decode are dropped here and never reach the caller.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

/// One datagram buffer: a full sync response with a large member list still
/// fits well inside a 64 KiB datagram.
const RECV_BUFFER_LEN: usize = 64 * 1024;

impl UdpTransport {
    /// Bind the control-plane socket
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("transport bound on {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Fire-and-forget send. Errors are reported to the caller but carry no
    /// delivery guarantee either way; the suspect timer drives liveness.
    pub async fn send(&self, msg: &Message, target: &str) -> Result<()> {
        let frame = msg.encode();
        self.socket.send_to(&frame, target).await?;
        trace!(kind = ?msg.kind, target, "sent {} bytes", frame.len());
        Ok(())
    }

    /// Timeout-bounded blocking receive.
    ///
    /// Returns `None` on timeout or when the received frame fails to decode
    /// (bad magic/version/short read — dropped, no retry).
    pub async fn recv(&self, timeout_ms: u64) -> Result<Option<(Message, SocketAddr)>> {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        let received =
            tokio::time::timeout(Duration::from_millis(timeout_ms), self.socket.recv_from(&mut buf))
                .await;

        match received {
            Err(_elapsed) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok((len, from))) => match Message::decode(&buf[..len]) {
                Ok(msg) => Ok(Some((msg, from))),
                Err(e) => {
                    debug!(%from, "dropping undecodable frame: {e}");
                    Ok(None)
                }
            },
        }
    }
}
