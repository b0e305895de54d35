//! bTCP client socket: active open, reliable send, teardown.
//!
//! # Architecture
//!
//! ```text
//!  Application task                       Handler task
//!  connect / send / disconnect            (spawn_dispatcher)
//!      │                                        │ SYN+ACK, ACK, FIN+ACK
//!      ▼                                        ▼
//!  ┌──────────────────────── ClientInner ─────────────────────────┐
//!  │ Endpoint<ClientState>   state cell + connection event         │
//!  │ Mutex<SendWindow>       go-back-N bookkeeping (second lock)   │
//!  │ Mutex<Vec<u16>>         handshake attempts awaiting SYN+ACK   │
//!  │ Notify                  "an ACK arrived" for the send loop    │
//!  └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The send loop and the ACK handler mutate the window only while holding
//! its lock; neither lock is held across an `.await`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::{spawn_dispatcher, ConnError, Endpoint, SegmentHandler};
use crate::segment::{random_seq, Flags, Segment};
use crate::sender::{AckOutcome, SendWindow};
use crate::state::{ClientEvent, ClientState};
use crate::transport::{Inbound, Transport, UdpTransport};

struct ClientInner {
    endpoint: Endpoint<ClientState>,
    window: Mutex<SendWindow>,
    /// `seq + 1` of every SYN sent by the current `connect`.
    syn_acks: Mutex<Vec<u16>>,
    acked: Notify,
    /// A stream was fully delivered on the current connection.
    streamed: AtomicBool,
}

impl ClientInner {
    fn window(&self) -> MutexGuard<'_, SendWindow> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn syn_acks(&self) -> MutexGuard<'_, Vec<u16>> {
        self.syn_acks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send whatever the window allows and handle an expired timer.
    ///
    /// Returns how long the send loop may sleep before looking again.
    fn pump(&self, w: &mut SendWindow, now: Instant) -> Duration {
        let timeout = self.endpoint.config.timeout;

        for index in w.take_sendable(now) {
            self.endpoint.transmit_raw(w.frame(index));
        }
        w.prune();

        if w.check_timeout(now, timeout) {
            log::debug!(
                "[send] timeout, going back to segment {} of {}",
                w.last_acked(),
                w.len()
            );
            for index in w.take_sendable(now) {
                self.endpoint.transmit_raw(w.frame(index));
            }
        }

        w.next_deadline(timeout)
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(timeout)
    }

    fn on_syn_ack(&self, segment: &Segment) {
        if !self.syn_acks().contains(&segment.ack_n) {
            log::debug!("[client] SYN+ACK for unknown attempt ack={}", segment.ack_n);
            return;
        }
        if self.endpoint.state.apply(ClientEvent::SynAckReceived).is_none() {
            return;
        }
        let ack = Segment::ack(
            segment.ack_n,
            segment.seq_n.wrapping_add(1),
            self.endpoint.config.window,
        );
        self.endpoint.transmit(&ack);
        self.endpoint.set_connected(true);
        log::info!("[client] connection established");
    }

    fn on_ack(&self, segment: &Segment) {
        let outcome = self.window().on_ack(segment.seq_n, segment.ack_n);
        match outcome {
            AckOutcome::FastRetransmit { index } => {
                log::debug!("[send] triple duplicate ACK, going back to segment {index}");
            }
            AckOutcome::Finished => log::debug!("[send] end of stream acknowledged"),
            AckOutcome::Idle => return,
            _ => log::trace!("[send] ack={} -> {outcome:?}", segment.ack_n),
        }
        self.acked.notify_one();
    }
}

impl SegmentHandler for ClientInner {
    fn role(&self) -> &'static str {
        "client"
    }

    fn handle(&self, segment: Segment) {
        // Every intact segment carries the peer's current window.
        self.window().set_peer_window(segment.window);

        let state = self.endpoint.state.get();
        let flags = segment.flags;
        if flags == Flags::SYN | Flags::ACK && state == ClientState::SynSent {
            self.on_syn_ack(&segment);
        } else if flags == Flags::FIN | Flags::ACK && state == ClientState::FinSent {
            log::info!("[client] connection terminated");
            self.endpoint.set_connected(false);
        } else if flags == Flags::ACK && state == ClientState::Sending {
            self.on_ack(&segment);
        } else {
            log::debug!("[client] ignoring {flags} in state {state}");
        }
    }
}

/// Client side of a bTCP connection.
///
/// Build one with [`ClientSocket::new`] over any [`Transport`], or with
/// [`ClientSocket::bind`] over UDP.  Must be created inside a tokio runtime.
pub struct ClientSocket {
    inner: Arc<ClientInner>,
    dispatcher: JoinHandle<()>,
}

impl ClientSocket {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        inbound: Inbound,
    ) -> Result<Self, ConnError> {
        let window = SendWindow::new(config.window);
        let inner = Arc::new(ClientInner {
            endpoint: Endpoint::new("client", config, transport)?,
            window: Mutex::new(window),
            syn_acks: Mutex::new(Vec::new()),
            acked: Notify::new(),
            streamed: AtomicBool::new(false),
        });
        let dispatcher = spawn_dispatcher(Arc::clone(&inner), inbound);
        Ok(Self { inner, dispatcher })
    }

    /// Client over UDP, bound to `local` and talking to `peer`.
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

    pub fn state(&self) -> ClientState {
        self.inner.endpoint.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.endpoint.is_connected()
    }

    /// Go-back-N rewinds (timeouts and fast retransmits) during the last
    /// `send`.
    pub fn retransmissions(&self) -> u32 {
        self.inner.window().retransmissions()
    }

    /// Three-way handshake.
    ///
    /// Sends up to `retries` SYNs, each with a fresh sequence number and
    /// each followed by a wait of `timeout` for the SYN+ACK.  A SYN+ACK
    /// answering any of the attempts completes the handshake.
    pub async fn connect(&self) -> Result<(), ConnError> {
        let endpoint = &self.inner.endpoint;
        if endpoint.state.apply(ClientEvent::Connect).is_none() {
            return Err(ConnError::bad_state("connect", endpoint.state.get()));
        }
        self.inner.syn_acks().clear();
        self.inner.streamed.store(false, Ordering::Relaxed);

        let Config {
            window,
            timeout,
            retries,
            ..
        } = endpoint.config;

        for attempt in 1..=retries {
            let syn = Segment::syn(random_seq(), window);
            self.inner.syn_acks().push(syn.seq_n.wrapping_add(1));
            log::debug!("[client] SYN attempt {attempt}/{retries} seq={}", syn.seq_n);
            endpoint.transmit(&syn);

            if endpoint.wait_connected(true, timeout).await {
                return Ok(());
            }
        }

        log::warn!("[client] no SYN+ACK after {retries} attempts");
        self.reset();
        Err(ConnError::ConnectTimeout { attempts: retries })
    }

    /// Reliably deliver `data` as one stream, returning once the receiver
    /// has acknowledged its end-of-stream segment.
    ///
    /// Fails with [`ConnError::PeerUnresponsive`] if `retries` consecutive
    /// timeouts pass without any ACK from the peer, and with
    /// [`ConnError::StreamClosed`] if a stream was already delivered on this
    /// connection.
    pub async fn send(&self, data: &[u8]) -> Result<(), ConnError> {
        let endpoint = &self.inner.endpoint;
        if self.inner.streamed.load(Ordering::Relaxed) {
            return Err(ConnError::StreamClosed);
        }
        if endpoint.state.apply(ClientEvent::SendStarted).is_none() {
            return Err(ConnError::bad_state("send", endpoint.state.get()));
        }

        {
            let mut w = self.inner.window();
            w.load(data, endpoint.config.window);
            log::debug!("[send] {} bytes in {} segments", data.len(), w.len());
        }

        let result = self.drive().await;
        if result.is_ok() {
            self.inner.streamed.store(true, Ordering::Relaxed);
        }
        endpoint.state.apply(ClientEvent::SendFinished);
        result
    }

    async fn drive(&self) -> Result<(), ConnError> {
        let retries = self.inner.endpoint.config.retries;
        loop {
            let wait = {
                let mut w = self.inner.window();
                if w.is_finished() {
                    return Ok(());
                }
                if w.stalled_rounds() > retries {
                    return Err(ConnError::PeerUnresponsive {
                        rounds: w.stalled_rounds(),
                    });
                }
                self.inner.pump(&mut w, Instant::now())
            };

            tokio::select! {
                _ = self.inner.acked.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Two-way teardown.
    ///
    /// Sends FIN up to `retries` times while the connection event is set,
    /// then resets to `Closed` whether or not a FIN+ACK ever arrived.
    pub async fn disconnect(&self) {
        let endpoint = &self.inner.endpoint;
        if endpoint.state.apply(ClientEvent::Disconnect).is_none() {
            return;
        }

        let fin = Segment::fin(0, endpoint.config.window);
        for attempt in 1..=endpoint.config.retries {
            if !endpoint.is_connected() {
                break;
            }
            log::debug!("[client] FIN attempt {attempt}");
            endpoint.transmit(&fin);
            if endpoint.wait_connected(false, endpoint.config.timeout).await {
                break;
            }
        }

        endpoint.state.apply(ClientEvent::Reset);
        endpoint.set_connected(false);
    }

    fn reset(&self) {
        let endpoint = &self.inner.endpoint;
        endpoint.set_connected(false);
        endpoint.state.reset();
        *self.inner.window() = SendWindow::new(endpoint.config.window);
        self.inner.syn_acks().clear();
        self.inner.streamed.store(false, Ordering::Relaxed);
    }

    /// Reset all state and detach from the transport.
    ///
    /// The socket cannot be used afterwards.
    pub fn close(&self) {
        self.reset();
        self.dispatcher.abort();
        self.inner.endpoint.detach();
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.inner.endpoint.detach();
    }
}
