//! Per-connection state machine and in-order reassembly

use super::ConnError;
use bytes::Bytes;
use std::collections::HashMap;

/// Most frames a connection may hold while waiting for a sequence gap to
/// fill. Overflow means the peer broke the sequence contract (or the network
/// did), and the connection is terminated.
pub const REORDER_LIMIT: usize = 1024;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Create requested, ack not yet received
    PendingCreate,
    /// Both directions open
    Established,
    /// One direction has finished
    HalfClosed,
    /// Fully closed
    Closed,
}

/// Receive-side bookkeeping for one user connection.
///
/// Frames for a connection may arrive over any tunnel, so they can overtake
/// each other. Delivery is strictly by sequence number starting at 1;
/// anything ahead of the cursor waits in the pending map, anything behind it
/// is a duplicate and is dropped.
#[derive(Debug)]
pub struct Connection {
    cid: u16,
    state: ConnState,
    rx_seq: u32,
    pending: HashMap<u32, Bytes>,
}

impl Connection {
    /// Create in `PendingCreate`, awaiting the peer's ack
    pub fn new(cid: u16) -> Self {
        Self {
            cid,
            state: ConnState::PendingCreate,
            rx_seq: 1,
            pending: HashMap::new(),
        }
    }

    /// Create in `Established` (acceptor side, where the ack originates)
    pub fn established(cid: u16) -> Self {
        let mut conn = Self::new(cid);
        conn.state = ConnState::Established;
        conn
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Next sequence number the user socket is waiting for
    pub fn rx_seq(&self) -> u32 {
        self.rx_seq
    }

    pub fn establish(&mut self) {
        if self.state == ConnState::PendingCreate {
            self.state = ConnState::Established;
        }
    }

    /// Mark one direction finished
    pub fn half_close(&mut self) {
        self.state = match self.state {
            ConnState::Established => ConnState::HalfClosed,
            ConnState::HalfClosed => ConnState::Closed,
            other => other,
        };
    }

    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Accept one data frame and return every payload now deliverable in
    /// order. Duplicates (seq behind the cursor) return an empty batch.
    pub fn accept(&mut self, seq: u32, payload: Bytes) -> Result<Vec<Bytes>, ConnError> {
        if seq < self.rx_seq {
            return Ok(Vec::new());
        }

        if seq > self.rx_seq {
            // hole ahead of us; park the frame until it fills
            self.pending.insert(seq, payload);
            if self.pending.len() > REORDER_LIMIT {
                return Err(ConnError::ReorderOverflow {
                    cid: self.cid,
                    pending: self.pending.len(),
                });
            }
            return Ok(Vec::new());
        }

        let mut batch = vec![payload];
        self.rx_seq += 1;
        while let Some(next) = self.pending.remove(&self.rx_seq) {
            batch.push(next);
            self.rx_seq += 1;
        }
        Ok(batch)
    }

    /// Frames currently parked behind a sequence gap
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_delivery() {
        let mut conn = Connection::established(1);

        let batch = conn.accept(1, Bytes::from_static(b"he")).unwrap();
        assert_eq!(batch, vec![Bytes::from_static(b"he")]);

        let batch = conn.accept(2, Bytes::from_static(b"wo")).unwrap();
        assert_eq!(batch, vec![Bytes::from_static(b"wo")]);
        assert_eq!(conn.rx_seq(), 3);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut conn = Connection::established(7);

        // seq 2 arrives first and waits
        let batch = conn.accept(2, Bytes::from_static(b"wo")).unwrap();
        assert!(batch.is_empty());
        assert_eq!(conn.pending_len(), 1);

        // seq 1 releases both
        let batch = conn.accept(1, Bytes::from_static(b"he")).unwrap();
        assert_eq!(
            batch,
            vec![Bytes::from_static(b"he"), Bytes::from_static(b"wo")]
        );
        assert_eq!(conn.pending_len(), 0);
        assert_eq!(conn.rx_seq(), 3);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut conn = Connection::established(3);

        conn.accept(1, Bytes::from_static(b"a")).unwrap();
        let batch = conn.accept(1, Bytes::from_static(b"a")).unwrap();
        assert!(batch.is_empty());
        assert_eq!(conn.rx_seq(), 2);
    }

    #[test]
    fn test_long_gap_then_fill() {
        let mut conn = Connection::established(5);

        for seq in (2..=10).rev() {
            let payload = Bytes::from(vec![seq as u8]);
            assert!(conn.accept(seq, payload).unwrap().is_empty());
        }

        let batch = conn.accept(1, Bytes::from(vec![1u8])).unwrap();
        assert_eq!(batch.len(), 10);
        for (i, payload) in batch.iter().enumerate() {
            assert_eq!(payload[0], (i + 1) as u8);
        }
    }

    #[test]
    fn test_reorder_overflow_terminates() {
        let mut conn = Connection::established(9);

        // fill the buffer with frames ahead of the cursor, never seq 1
        for seq in 2..(2 + REORDER_LIMIT as u32) {
            conn.accept(seq, Bytes::from_static(b"x")).unwrap();
        }
        let err = conn
            .accept(2 + REORDER_LIMIT as u32, Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(matches!(err, ConnError::ReorderOverflow { cid: 9, .. }));
    }

    #[test]
    fn test_state_transitions() {
        let mut conn = Connection::new(1);
        assert_eq!(conn.state(), ConnState::PendingCreate);

        conn.establish();
        assert_eq!(conn.state(), ConnState::Established);

        conn.half_close();
        assert_eq!(conn.state(), ConnState::HalfClosed);
        assert!(!conn.is_closed());

        conn.half_close();
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(conn.is_closed());
    }
}
