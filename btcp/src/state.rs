//! Connection finite-state machine (FSM) types.
//!
//! Each role has its own state enum and event enum.  Transitions are pure
//! functions of `(state, event)`: [`Machine::on`] returns `None` for an event
//! the current state does not define, and [`Machine::next`] turns that into
//! "stay put", so undefined transitions are ignored rather than errors.
//!
//! [`StateCell`] is the shared, lock-guarded home of the current state.  The
//! application task and the inbound handler task both go through it, and
//! every read-modify-write happens inside one critical section.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// A role's state machine.
pub trait Machine: Copy + Eq + fmt::Debug + Default + Send + 'static {
    type Event: Copy + fmt::Debug;

    /// The state reached by applying `event`, or `None` when the event is not
    /// defined for `self`.
    fn on(self, event: Self::Event) -> Option<Self>;

    /// Total transition function: undefined events leave the state unchanged.
    fn next(self, event: Self::Event) -> Self {
        self.on(event).unwrap_or(self)
    }
}

/// Client (active opener, data sender) states.
///
/// ```text
///  Closed ──connect──▶ SynSent ──SYN+ACK──▶ Established ⇄ Sending
///    ▲                    │                      │
///    │◀──retries exhausted┘           disconnect │
///    │                                           ▼
///    └──────────────── disconnect/close ───── FinSent
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// No connection exists; initial state.
    #[default]
    Closed,
    /// SYN has been sent; waiting for SYN+ACK.
    SynSent,
    /// Three-way handshake complete; idle.
    Established,
    /// A `send` call is driving the sliding window.
    Sending,
    /// FIN has been sent; waiting for FIN+ACK.
    FinSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Connect,
    SynAckReceived,
    SendStarted,
    SendFinished,
    Disconnect,
    /// Handshake gave up, teardown finished, or the socket was closed.
    Reset,
}

impl Machine for ClientState {
    type Event = ClientEvent;

    fn on(self, event: ClientEvent) -> Option<Self> {
        use ClientEvent::*;
        use ClientState::*;

        match (self, event) {
            (_, Reset) => Some(Closed),
            (Closed, Connect) => Some(SynSent),
            (SynSent, SynAckReceived) => Some(Established),
            (Established, SendStarted) => Some(Sending),
            (Sending, SendFinished) => Some(Established),
            (SynSent | Established | Sending, Disconnect) => Some(FinSent),
            _ => None,
        }
    }
}

/// Server (passive opener, data receiver) states.
///
/// ```text
///  Closed ──accept──▶ Accepting ──SYN──▶ SynAckSent ──ACK──▶ Established
///    ▲                                       │  ▲ SYN              │
///    │                                       └──┘                  │
///    └──────────────────────── FIN ◀───────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    #[default]
    Closed,
    /// Waiting for a SYN.
    Accepting,
    /// SYN+ACK sent; waiting for the ACK completing the handshake.
    SynAckSent,
    Established,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Listen,
    SynReceived,
    AckReceived,
    /// First data segment while the handshake ACK is still outstanding.
    DataReceived,
    FinReceived,
    Reset,
}

impl Machine for ServerState {
    type Event = ServerEvent;

    fn on(self, event: ServerEvent) -> Option<Self> {
        use ServerEvent::*;
        use ServerState::*;

        match (self, event) {
            (_, Reset) => Some(Closed),
            (Closed, Listen) => Some(Accepting),
            (Accepting | SynAckSent, SynReceived) => Some(SynAckSent),
            (SynAckSent, AckReceived | DataReceived) => Some(Established),
            (SynAckSent | Established, FinReceived) => Some(Closed),
            _ => None,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Lock-guarded current state of one socket.
#[derive(Debug)]
pub struct StateCell<S> {
    role: &'static str,
    state: Mutex<S>,
}

impl<S: Machine> StateCell<S> {
    pub fn new(role: &'static str) -> Self {
        Self {
            role,
            state: Mutex::new(S::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, S> {
        // A poisoned cell still holds a valid state value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> S {
        *self.lock()
    }

    /// Atomically apply `event`.
    ///
    /// Returns the new state if the event was defined for the current state,
    /// `None` (state untouched) otherwise.
    pub fn apply(&self, event: S::Event) -> Option<S> {
        let mut state = self.lock();
        let next = state.on(event)?;
        if next != *state {
            log::debug!("[{}] state {:?} -> {:?} on {:?}", self.role, *state, next, event);
            *state = next;
        }
        Some(next)
    }

    /// Force the default (closed) state.
    pub fn reset(&self) {
        let mut state = self.lock();
        if *state != S::default() {
            log::debug!("[{}] state {:?} -> {:?} (reset)", self.role, *state, S::default());
            *state = S::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_happy_path() {
        let s = ClientState::Closed
            .next(ClientEvent::Connect)
            .next(ClientEvent::SynAckReceived);
        assert_eq!(s, ClientState::Established);
        let s = s.next(ClientEvent::SendStarted);
        assert_eq!(s, ClientState::Sending);
        let s = s.next(ClientEvent::SendFinished).next(ClientEvent::Disconnect);
        assert_eq!(s, ClientState::FinSent);
        assert_eq!(s.next(ClientEvent::Reset), ClientState::Closed);
    }

    #[test]
    fn client_undefined_transitions_are_ignored() {
        assert_eq!(ClientState::Closed.on(ClientEvent::SendStarted), None);
        assert_eq!(
            ClientState::Closed.next(ClientEvent::SynAckReceived),
            ClientState::Closed
        );
        assert_eq!(
            ClientState::Established.next(ClientEvent::SynAckReceived),
            ClientState::Established
        );
        assert_eq!(
            ClientState::Sending.next(ClientEvent::Connect),
            ClientState::Sending
        );
        assert_eq!(ClientState::Closed.on(ClientEvent::Disconnect), None);
    }

    #[test]
    fn server_happy_path_and_fin() {
        let s = ServerState::Closed
            .next(ServerEvent::Listen)
            .next(ServerEvent::SynReceived);
        assert_eq!(s, ServerState::SynAckSent);
        // A retransmitted SYN keeps us waiting for the ACK.
        assert_eq!(s.on(ServerEvent::SynReceived), Some(ServerState::SynAckSent));
        let s = s.next(ServerEvent::AckReceived);
        assert_eq!(s, ServerState::Established);
        assert_eq!(s.next(ServerEvent::FinReceived), ServerState::Closed);
    }

    #[test]
    fn server_ignores_out_of_state_segments() {
        assert_eq!(ServerState::Closed.on(ServerEvent::SynReceived), None);
        assert_eq!(ServerState::Established.on(ServerEvent::SynReceived), None);
        assert_eq!(ServerState::Accepting.on(ServerEvent::AckReceived), None);
        assert_eq!(ServerState::Accepting.on(ServerEvent::FinReceived), None);
        assert_eq!(
            ServerState::SynAckSent.on(ServerEvent::DataReceived),
            Some(ServerState::Established)
        );
    }

    #[test]
    fn cell_applies_atomically_and_reports_undefined() {
        let cell = StateCell::<ServerState>::new("server");
        assert_eq!(cell.apply(ServerEvent::AckReceived), None);
        assert_eq!(cell.get(), ServerState::Closed);
        assert_eq!(cell.apply(ServerEvent::Listen), Some(ServerState::Accepting));
        cell.reset();
        assert_eq!(cell.get(), ServerState::Closed);
    }
}
