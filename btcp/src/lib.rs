//! `btcp`: a reliable, connection-oriented byte stream over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   data segments   ┌──────────────┐
//!  │ ClientSocket │──────────────────▶│ ServerSocket │
//!  │  SendWindow  │                   │   Receiver   │
//!  └──────┬───────┘◀──────────────────└──────┬───────┘
//!         │        cumulative ACKs           │
//!  ┌──────▼───────────────────────────────────▼──────┐
//!  │   connection: Endpoint + handler task per side  │
//!  └──────┬──────────────────────────────────────────┘
//!         │ 1018-byte datagrams
//!  ┌──────▼──────────────────────┐
//!  │ Transport: UDP or SimLink   │
//!  └─────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`segment`]   : wire format, checksum
//! - [`state`]     : client and server state machines
//! - [`config`]    : window, timeout and retry settings
//! - [`sender`]    : go-back-N send window with fast retransmit
//! - [`receiver`]  : in-order receive with cumulative ACKs
//! - [`connection`]: shared endpoint plumbing and error type
//! - [`client`]    : active open, reliable send, teardown
//! - [`server`]    : passive open, in-order receive
//! - [`transport`] : datagram layer abstraction and UDP implementation
//! - [`simulator`] : in-memory lossy link for testing

pub mod client;
pub mod config;
pub mod connection;
pub mod receiver;
pub mod segment;
pub mod sender;
pub mod server;
pub mod simulator;
pub mod state;
pub mod transport;

pub use client::ClientSocket;
pub use config::{Config, ConfigError};
pub use connection::ConnError;
pub use segment::{Flags, Segment, SegmentError};
pub use server::ServerSocket;
pub use state::{ClientState, ServerState};
pub use transport::{Transport, UdpTransport};
