//! The unreliable datagram layer underneath bTCP.
//!
//! The protocol engine only needs two things from it: a fire-and-forget
//! [`Transport::send_segment`], and a stream of inbound frames.  Inbound
//! frames arrive on an unbounded channel ([`Inbound`]) that each socket
//! drains from its own handler task, so the transport never calls into
//! protocol code directly.
//!
//! [`UdpTransport`] is the real implementation: a thin wrapper around
//! `tokio::net::UdpSocket` bound locally and aimed at a single peer.  The
//! in-memory link in [`crate::simulator`] is the other.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::segment::SEGMENT_LEN;

/// One received datagram and the address it came from.
pub type Frame = (Vec<u8>, SocketAddr);

/// Receiving end of a transport's inbound frames.
pub type Inbound = mpsc::UnboundedReceiver<Frame>;

/// Outbound half of the datagram layer as seen by a socket.
pub trait Transport: Send + Sync {
    /// Best-effort transmission of one encoded segment to the peer.
    ///
    /// Must not block; failures are the transport's to log and swallow.
    fn send_segment(&self, frame: &[u8]);

    /// Stop sending and receiving.  Called once when a socket is closed.
    fn detach(&self) {}
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// UdpTransport
// ---------------------------------------------------------------------------

/// UDP datagram transport to one fixed peer.
#[derive(Debug)]
pub struct UdpTransport {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    pub peer: SocketAddr,
    inner: Arc<UdpSocket>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind to `local_addr` and exchange datagrams with `peer`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(
        local_addr: SocketAddr,
        peer: SocketAddr,
    ) -> Result<(Arc<Self>, Inbound), TransportError> {
        let socket = UdpSocket::bind(local_addr).await?;
        Self::from_socket(socket, peer)
    }

    /// Wrap an already bound socket.
    ///
    /// Spawns the receive task, so this must run inside a tokio runtime.
    pub fn from_socket(
        socket: UdpSocket,
        peer: SocketAddr,
    ) -> Result<(Arc<Self>, Inbound), TransportError> {
        let local_addr = socket.local_addr()?;
        let inner = Arc::new(socket);
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(Arc::clone(&inner), tx));
        log::debug!("[udp] bound {local_addr}, peer {peer}");

        let transport = Arc::new(Self {
            local_addr,
            peer,
            inner,
            reader: Mutex::new(Some(reader)),
        });
        Ok((transport, rx))
    }
}

impl Transport for UdpTransport {
    fn send_segment(&self, frame: &[u8]) {
        if let Err(e) = self.inner.try_send_to(frame, self.peer) {
            // Dropped datagrams are indistinguishable from network loss.
            log::debug!("[udp] send to {} failed: {e}", self.peer);
        }
    }

    fn detach(&self) {
        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reader) = reader {
            reader.abort();
            log::debug!("[udp] {} detached", self.local_addr);
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Forward every full-size datagram into `tx` until the receiver goes away.
async fn read_loop(socket: Arc<UdpSocket>, tx: mpsc::UnboundedSender<Frame>) {
    // One spare byte so oversized datagrams are recognisable.
    let mut buf = vec![0u8; SEGMENT_LEN + 1];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                log::debug!("[udp] recv error: {e}");
                continue;
            }
        };
        if n != SEGMENT_LEN {
            log::warn!("[udp] dropping {n}-byte datagram from {from}");
            continue;
        }
        if tx.send((buf[..n].to_vec(), from)).is_err() {
            break;
        }
    }
}
