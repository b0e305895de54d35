//! bTCP server socket: passive open, in-order receive, FIN handling.
//!
//! The handler task owns all protocol reactions (SYN+ACK replies, data
//! acceptance, ACK generation, FIN+ACK); the application only waits on
//! events and drains the [`ReceiveBuffer`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::Config;
use crate::connection::{spawn_dispatcher, ConnError, Endpoint, SegmentHandler};
use crate::receiver::{ReceiveBuffer, Receiver, Verdict};
use crate::segment::{random_seq, Flags, Segment};
use crate::state::{ServerEvent, ServerState};
use crate::transport::{Inbound, Transport, UdpTransport};

struct ServerInner {
    endpoint: Endpoint<ServerState>,
    receiver: Mutex<Receiver>,
    buffer: ReceiveBuffer,
    disconnected: watch::Sender<bool>,
    /// Set once a connection reached `Established`; cleared by `close`.
    ever_connected: Mutex<bool>,
}

impl ServerInner {
    fn receiver(&self) -> MutexGuard<'_, Receiver> {
        self.receiver.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ever_connected(&self) -> bool {
        *self.ever_connected.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn established(&self) {
        *self.ever_connected.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.endpoint.set_connected(true);
        log::info!("[server] connection established");
    }

    fn on_syn(&self, segment: &Segment) {
        if self.endpoint.state.apply(ServerEvent::SynReceived).is_none() {
            log::debug!("[server] ignoring SYN in state {}", self.endpoint.state.get());
            return;
        }
        let syn_ack = Segment::syn_ack(
            random_seq(),
            segment.seq_n.wrapping_add(1),
            self.endpoint.config.window,
        );
        self.endpoint.transmit(&syn_ack);
    }

    fn on_ack(&self) {
        if self.endpoint.state.apply(ServerEvent::AckReceived).is_some() {
            self.established();
        }
    }

    fn on_fin(&self) {
        if self.endpoint.state.apply(ServerEvent::FinReceived).is_none() {
            log::debug!("[server] ignoring FIN in state {}", self.endpoint.state.get());
            return;
        }
        if self.endpoint.is_connected() {
            log::info!("[server] connection terminated");
        }
        self.endpoint.set_connected(false);
        self.disconnected.send_replace(true);
        self.endpoint.transmit(&Segment::fin_ack(self.endpoint.config.window));
        self.buffer.wake();
    }

    fn on_data(&self, segment: &Segment) {
        let fresh = self.receiver().expected().is_none();
        match self.endpoint.state.get() {
            ServerState::Established => {}
            ServerState::SynAckSent if segment.seq_n == 0 && fresh => {
                // The handshake ACK was lost but the client is already sending.
                if self.endpoint.state.apply(ServerEvent::DataReceived).is_some() {
                    self.established();
                }
            }
            state => {
                log::debug!("[server] ignoring data in state {state}");
                return;
            }
        }

        let reply = self.receiver().on_data(segment, &self.buffer);
        match reply.verdict {
            Verdict::EndOfStream => log::info!("[server] final segment received"),
            Verdict::BufferFull => log::debug!("[server] buffer full, seq={} refused", segment.seq_n),
            Verdict::OutOfOrder => log::trace!("[server] out-of-order seq={}", segment.seq_n),
            Verdict::Accepted => {}
        }
        if let Some(ack) = reply.ack {
            self.endpoint.transmit(&ack);
        }
    }
}

impl SegmentHandler for ServerInner {
    fn role(&self) -> &'static str {
        "server"
    }

    fn handle(&self, segment: Segment) {
        let flags = segment.flags;
        if flags == Flags::SYN {
            self.on_syn(&segment);
        } else if flags == Flags::ACK {
            self.on_ack();
        } else if flags == Flags::FIN {
            self.on_fin();
        } else if flags.is_empty() {
            self.on_data(&segment);
        } else {
            log::debug!("[server] ignoring {flags}");
        }
    }
}

/// Server side of a bTCP connection.
pub struct ServerSocket {
    inner: Arc<ServerInner>,
    dispatcher: JoinHandle<()>,
}

impl ServerSocket {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        inbound: Inbound,
    ) -> Result<Self, ConnError> {
        let buffer = ReceiveBuffer::new(config.window);
        let (disconnected, _) = watch::channel(false);
        let inner = Arc::new(ServerInner {
            endpoint: Endpoint::new("server", config, transport)?,
            receiver: Mutex::new(Receiver::new()),
            buffer,
            disconnected,
            ever_connected: Mutex::new(false),
        });
        let dispatcher = spawn_dispatcher(Arc::clone(&inner), inbound);
        Ok(Self { inner, dispatcher })
    }

    /// Server over UDP, bound to `local` and answering `peer`.
    pub async fn bind(
        config: Config,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Self, ConnError> {
        let (transport, inbound) = UdpTransport::bind(local, peer).await?;
        Self::new(config, transport, inbound)
    }

    pub fn config(&self) -> &Config {
        &self.inner.endpoint.config
    }

    pub fn state(&self) -> ServerState {
        self.inner.endpoint.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.endpoint.is_connected()
    }

    /// `true` once the end-of-stream segment has arrived.
    pub fn is_finished(&self) -> bool {
        self.inner.receiver().is_finished()
    }

    /// Chunks waiting in the receive buffer.
    pub fn buffered(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Start accepting SYNs without waiting for the handshake to finish.
    pub fn listen(&self) {
        let endpoint = &self.inner.endpoint;
        if endpoint.state.apply(ServerEvent::Listen).is_some() {
            *self.inner.receiver() = Receiver::new();
            self.inner.disconnected.send_replace(false);
            log::debug!("[server] accepting");
        }
    }

    /// Accept a connection, waiting as long as it takes.
    pub async fn accept(&self) -> Result<(), ConnError> {
        self.listen();
        self.inner.endpoint.wait_connected_forever(true).await;
        Ok(())
    }

    /// Accept a connection, giving up after `limit`.
    ///
    /// On expiry the socket goes back to `Closed`.
    pub async fn accept_timeout(&self, limit: Duration) -> Result<(), ConnError> {
        self.listen();
        if self.inner.endpoint.wait_connected(true, limit).await {
            return Ok(());
        }
        self.inner.endpoint.state.reset();
        Err(ConnError::AcceptTimeout(limit))
    }

    /// Wait up to `limit` for the peer's FIN; returns whether it came.
    pub async fn wait_disconnected(&self, limit: Duration) -> bool {
        let mut rx = self.inner.disconnected.subscribe();
        let result = timeout(limit, rx.wait_for(|d| *d)).await;
        matches!(result, Ok(Ok(_)))
    }

    fn check_connected(&self) -> Result<(), ConnError> {
        if !self.inner.ever_connected() && self.state() == ServerState::Closed {
            return Err(ConnError::NotConnected);
        }
        Ok(())
    }

    /// Take the next chunk if one is queued; an empty chunk otherwise.
    pub fn try_recv(&self) -> Result<Vec<u8>, ConnError> {
        if let Some(chunk) = self.inner.buffer.pop() {
            return Ok(chunk);
        }
        self.check_connected()?;
        Ok(Vec::new())
    }

    /// Next chunk of the stream, in order.
    ///
    /// Waits while the stream is still open.  Returns an empty chunk once the
    /// buffer is drained and either the end-of-stream segment arrived or the
    /// connection was closed.
    pub async fn recv(&self) -> Result<Vec<u8>, ConnError> {
        loop {
            let notified = self.inner.buffer.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(chunk) = self.inner.buffer.pop() {
                return Ok(chunk);
            }
            self.check_connected()?;
            let closed = self.inner.ever_connected() && self.state() == ServerState::Closed;
            if closed || self.is_finished() {
                return Ok(Vec::new());
            }

            notified.await;
        }
    }

    /// Collect the whole stream.
    pub async fn recv_all(&self) -> Result<Vec<u8>, ConnError> {
        let mut data = Vec::new();
        loop {
            let chunk = self.recv().await?;
            if chunk.is_empty() {
                return Ok(data);
            }
            data.extend_from_slice(&chunk);
        }
    }

    /// Reset all state and detach from the transport.
    pub fn close(&self) {
        let inner = &self.inner;
        inner.endpoint.set_connected(false);
        inner.endpoint.state.reset();
        *inner.receiver() = Receiver::new();
        *inner.ever_connected.lock().unwrap_or_else(|e| e.into_inner()) = false;
        inner.buffer.clear();
        self.dispatcher.abort();
        inner.endpoint.detach();
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.inner.endpoint.detach();
    }
}
