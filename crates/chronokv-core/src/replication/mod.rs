//! Peer-to-peer replication
//!
//! Every node keeps a TCP session with each configured peer. After an
//! identity handshake both sides run the same steady state:
//!
//! ```text
//!            drain_next(peer)                    apply_incoming(peer)
//! ┌────────┐ ───────── full record ──────────► ┌────────┐
//! │ node A │                                    │ node B │
//! └────────┘ ◄──────── acknowledgement ──────── └────────┘
//!            apply_incoming(peer)                drain_next(peer)
//! ```
//!
//! A record stays in the sender's per-peer backlog until the peer
//! acknowledges it, so interrupted sessions simply resend on reconnect.
//! Receivers apply records idempotently and resolve conflicts per key by
//! timestamp, which makes all nodes converge whatever the delivery order.
//!
//! # Wire Protocol
//!
//! Length-prefixed frames of length-prefixed elements, see [`protocol`].

pub mod config;
pub mod protocol;
pub mod service;
pub mod session;

pub use config::{ConnectPeer, ReplicatorConfig};
pub use protocol::{Decoded, Message, MessageCodec, decode_frame, encode_message};
pub use service::ReplicatorService;
pub use session::{SessionRole, SessionState, SessionStats};

/// Listening port used when peers are accepted but no port is configured
pub const DEFAULT_REPLICATION_PORT: u16 = 15480;

/// Default pause between outbound connection attempts in milliseconds
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;

/// Default bound on how long an idle session waits before re-scanning
/// its backlog, in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default TCP connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default time allowed for the identity exchange in milliseconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Records written to the socket before an explicit flush
pub const SEND_BATCH: usize = 64;
