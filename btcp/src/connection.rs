//! Pieces shared by the client and server sockets.
//!
//! An [`Endpoint`] bundles what both roles need for one connection:
//! - the configuration,
//! - the lock-guarded state cell (see [`crate::state`]),
//! - the transport to the peer,
//! - the "connection established" event, a `watch` channel both the
//!   application task and the handler task can set, clear, and wait on.
//!
//! [`spawn_dispatcher`] starts the per-socket handler task: it drains the
//! transport's inbound channel, rejects malformed and corrupted frames, and
//! hands every surviving [`Segment`] to the role's [`SegmentHandler`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{Config, ConfigError};
use crate::segment::{self, Segment};
use crate::state::{Machine, StateCell};
use crate::transport::{Inbound, Transport, TransportError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced to callers of the socket API.
///
/// Nothing on the inbound path produces these: a bad segment is dropped and
/// left to the retransmission machinery.
#[derive(Debug, Error)]
pub enum ConnError {
    /// No SYN+ACK arrived for any of the handshake attempts.
    #[error("connection timed out after {attempts} SYN attempts")]
    ConnectTimeout { attempts: u32 },
    /// `accept_timeout` expired before the handshake completed.
    #[error("no connection established within {0:?}")]
    AcceptTimeout(Duration),
    /// The receiver stopped acknowledging anything.
    #[error("peer unresponsive after {rounds} retransmission rounds")]
    PeerUnresponsive { rounds: u32 },
    /// Operation not valid in the socket's current state.
    #[error("cannot {op} in state {state}")]
    BadState { op: &'static str, state: String },
    /// The receiver already saw the end of this connection's stream.
    #[error("a stream was already sent on this connection")]
    StreamClosed,
    /// `recv` on a socket that never had a connection.
    #[error("socket is not connected")]
    NotConnected,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ConnError {
    pub(crate) fn bad_state(op: &'static str, state: impl std::fmt::Display) -> Self {
        Self::BadState {
            op,
            state: state.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// State, configuration and transport of one socket.
pub(crate) struct Endpoint<S> {
    pub config: Config,
    pub state: StateCell<S>,
    role: &'static str,
    transport: Arc<dyn Transport>,
    connected: watch::Sender<bool>,
}

impl<S: Machine> Endpoint<S> {
    pub fn new(
        role: &'static str,
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConnError> {
        config.validate()?;
        let (connected, _) = watch::channel(false);
        Ok(Self {
            config,
            state: StateCell::new(role),
            role,
            transport,
            connected,
        })
    }

    /// Encode and transmit one segment.
    pub fn transmit(&self, segment: &Segment) {
        log::trace!(
            "[{}] -> {} seq={} ack={} win={} len={}",
            self.role,
            segment.flags,
            segment.seq_n,
            segment.ack_n,
            segment.window,
            segment.data_length
        );
        self.transport.send_segment(&segment.encode());
    }

    /// Transmit an already encoded segment.
    pub fn transmit_raw(&self, frame: &[u8]) {
        self.transport.send_segment(frame);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Set or clear the connection event.
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    /// Wait until the connection event equals `want`, at most `limit`.
    ///
    /// Returns whether it did.
    pub async fn wait_connected(&self, want: bool, limit: Duration) -> bool {
        let mut rx = self.connected.subscribe();
        let result = timeout(limit, rx.wait_for(|c| *c == want)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Wait without a bound until the connection event equals `want`.
    pub async fn wait_connected_forever(&self, want: bool) {
        let mut rx = self.connected.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|c| *c == want).await;
    }

    pub fn detach(&self) {
        self.transport.detach();
    }
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

/// Role-specific reaction to an intact inbound segment.
///
/// Runs on the handler task; implementations must not block or panic.
pub(crate) trait SegmentHandler: Send + Sync + 'static {
    fn role(&self) -> &'static str;
    fn handle(&self, segment: Segment);
}

/// Spawn the task that feeds `inbound` frames into `handler`.
pub(crate) fn spawn_dispatcher<H: SegmentHandler>(
    handler: Arc<H>,
    mut inbound: Inbound,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((bytes, from)) = inbound.recv().await {
            let segment = match Segment::decode(&bytes) {
                Ok(segment) => segment,
                Err(e) => {
                    log::warn!("[{}] framing error from {from}: {e}", handler.role());
                    continue;
                }
            };
            if !segment::is_intact(&bytes) {
                log::debug!("[{}] corrupted segment from {from}, discarding", handler.role());
                continue;
            }
            handler.handle(segment);
        }
        log::debug!("[{}] inbound channel closed", handler.role());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{self, FaultModel};
    use crate::state::ClientState;

    fn endpoint() -> Endpoint<ClientState> {
        let ((link, _rx), _) = simulator::pair(FaultModel::default(), FaultModel::default());
        Endpoint::new("client", Config::default(), link).expect("endpoint")
    }

    #[tokio::test]
    async fn wait_connected_times_out_when_event_unset() {
        let endpoint = endpoint();
        assert!(!endpoint.wait_connected(true, Duration::from_millis(20)).await);
        assert!(endpoint.wait_connected(false, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn wait_connected_sees_event_set_while_waiting() {
        let endpoint = Arc::new(endpoint());
        let setter = Arc::clone(&endpoint);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set_connected(true);
        });
        assert!(endpoint.wait_connected(true, Duration::from_secs(2)).await);
        assert!(endpoint.is_connected());
    }
}
