//! Tunnel layer - framed transport between the two nodes
//!
//! Provides:
//! - Frame encoding/decoding
//! - Tunnel workers (one TCP connection each, bidirectional frame pumps)
//! - Work-mode expansion and worker supervision

mod frame;
mod manager;
mod worker;

pub use frame::{Frame, FrameHeader, FRAME_HEADER_SIZE};
pub use manager::{expand_pairs, RestartPolicy, TunnelManager, WorkMode};
pub use worker::{SharedEgress, TunnelWorker};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("Address resolution failed for {0}")]
    Resolve(String),

    #[error("Mismatched address lists: {locals} local vs {remotes} remote")]
    MismatchedAddrs { locals: usize, remotes: usize },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
