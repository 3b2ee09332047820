//! Control-plane definitions and constants
//!
//! Control frames share the data-frame shape: a frame whose `Length` field is
//! zero carries no payload, and its `SeqNum` field holds a [`Signal`] instead
//! of a sequence number. Data sequence numbers start at 1 per connection, so
//! the only overlap is `HEARTBEAT` (0), which is bound to no connection.

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown control signal: {0}")]
    UnknownSignal(u32),

    #[error("Signal {0:?} not valid on this side of the link")]
    WrongSide(Signal),

    #[error("Short frame header: got {0} bytes, need 8")]
    ShortHeader(usize),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Interval between tunnel keep-alive frames
pub const HEARTBEAT_INTERVAL_SECS: u64 = 300;

/// Interval between per-tunnel traffic reports
pub const STAT_REPORT_INTERVAL_SECS: u64 = 30;

/// Control signals carried in the `SeqNum` field of zero-length frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Signal {
    /// Tunnel keep-alive
    Heartbeat = 0,
    /// Ask the peer to create the upstream connection
    CreateConn = 1,
    /// Acknowledge CreateConn
    CreateConnOk = 2,
    /// Close the user connection
    CloseConn = 3,
    /// Acknowledge CloseConn
    CloseConnOk = 4,
    /// This tunnel is shutting down
    CloseTunnel = 5,
}

impl TryFrom<u32> for Signal {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Signal::Heartbeat),
            1 => Ok(Signal::CreateConn),
            2 => Ok(Signal::CreateConnOk),
            3 => Ok(Signal::CloseConn),
            4 => Ok(Signal::CloseConnOk),
            5 => Ok(Signal::CloseTunnel),
            other => Err(ProtocolError::UnknownSignal(other)),
        }
    }
}

/// Precomputed wire bytes for the tunnel-level keep-alive frame
pub const HEARTBEAT_FRAME: [u8; 8] = control_frame(Signal::Heartbeat);

/// Precomputed wire bytes for the tunnel shutdown frame
pub const CLOSE_TUNNEL_FRAME: [u8; 8] = control_frame(Signal::CloseTunnel);

/// Encode a tunnel-level control frame (`cid = 0`, `len = 0`)
const fn control_frame(signal: Signal) -> [u8; 8] {
    let seq = (signal as u32).to_le_bytes();
    [0, 0, 0, 0, seq[0], seq[1], seq[2], seq[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_roundtrip() {
        for code in 0u32..=5 {
            let signal = Signal::try_from(code).unwrap();
            assert_eq!(signal as u32, code);
        }
    }

    #[test]
    fn test_unknown_signal_rejected() {
        assert!(matches!(
            Signal::try_from(6),
            Err(ProtocolError::UnknownSignal(6))
        ));
    }

    #[test]
    fn test_precomputed_control_frames() {
        assert_eq!(HEARTBEAT_FRAME, [0u8; 8]);
        assert_eq!(CLOSE_TUNNEL_FRAME, [0, 0, 0, 0, 5, 0, 0, 0]);
    }
}
