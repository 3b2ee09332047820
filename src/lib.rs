//! # Braid
//!
//! A TCP traffic multiplexer. A client node accepts local TCP connections
//! and forwards their byte streams through one or more parallel tunnels
//! (plain TCP connections) to a server node, which re-establishes peer
//! connections to an upstream target and shuttles bytes back.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 User Applications                    │
//! │          (any TCP client / upstream target)          │
//! ├─────────────────────────────────────────────────────┤
//! │                 Connection Layer                     │
//! │   (per-connection handlers, sequence reassembly,     │
//! │    connection table and id allocation)               │
//! ├─────────────────────────────────────────────────────┤
//! │                  Tunnel Layer                        │
//! │   (framing, N parallel workers, heartbeat,           │
//! │    work-mode supervision)                            │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport Layer                      │
//! │                   (plain TCP)                        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Every user connection gets a 16-bit connection id. Its bytes travel as
//! fixed-header frames over whichever tunnel grabs them first, and the far
//! side reassembles the stream by sequence number.

pub mod config;
pub mod conn;
pub mod protocol;
pub mod stats;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest payload the inbound path will accept (64 KB)
pub const MAX_DATA_LENGTH: usize = 65536;

/// Largest payload a single frame can carry on the wire (16-bit length field)
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Highest assignable connection id
pub const MAX_CONN_ID: u16 = 65535;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Connection error: {0}")]
    Conn(#[from] conn::ConnError),

    #[error("Configuration error: {0}")]
    Config(String),
}
