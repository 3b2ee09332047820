//! Connection layer - user-facing TCP sessions
//!
//! Provides:
//! - Per-connection state machine and sequence reassembly
//! - Per-connection read/write handlers
//! - The connection table, id allocation and ingress dispatch

mod handler;
mod manager;
mod state;

pub use handler::ConnHandler;
pub use manager::ConnManager;
pub use state::{ConnState, Connection, REORDER_LIMIT};

use thiserror::Error;

/// Connection layer errors
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("Peer rejected connection create for cid {0}")]
    CreateRejected(u16),

    #[error("Reorder buffer overflow on cid {cid}: {pending} frames pending")]
    ReorderOverflow { cid: u16, pending: usize },

    #[error("Channel closed")]
    ChannelClosed,
}
