//! Per-tunnel traffic accounting

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Sent/received byte counters for one tunnel worker.
///
/// Counters are bumped by the owning worker as writes and reads complete;
/// the reporting ticker only ever loads them.
#[derive(Debug)]
pub struct Statistic {
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    start: Instant,
}

impl Statistic {
    pub fn new() -> Self {
        Self {
            sent_bytes: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    pub fn add_sent(&self, bytes: u64) {
        self.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    /// Average send rate in bytes per second since the worker started
    pub fn send_rate(&self) -> u64 {
        Self::rate(self.sent_bytes(), self.start.elapsed().as_secs())
    }

    /// Average receive rate in bytes per second since the worker started
    pub fn receive_rate(&self) -> u64 {
        Self::rate(self.received_bytes(), self.start.elapsed().as_secs())
    }

    fn rate(bytes: u64, elapsed_secs: u64) -> u64 {
        bytes / elapsed_secs.max(1)
    }
}

impl Default for Statistic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stat = Statistic::new();
        stat.add_sent(100);
        stat.add_sent(50);
        stat.add_received(7);

        assert_eq!(stat.sent_bytes(), 150);
        assert_eq!(stat.received_bytes(), 7);
    }

    #[test]
    fn test_rate_never_divides_by_zero() {
        let stat = Statistic::new();
        stat.add_sent(1024);
        // elapsed is ~0s here; the rate clamps the divisor instead of panicking
        assert!(stat.send_rate() > 0);
        assert_eq!(stat.receive_rate(), 0);
    }
}
