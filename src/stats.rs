use std::sync::atomic::{AtomicU64, Ordering};

/// Transport-wide counters, shared lock-free between the receive loop, the
/// management loop and the send API.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_retransmitted: AtomicU64,
    pub packets_dropped: AtomicU64,
}

impl TransportStats {
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_retransmit(&self, bytes: usize) {
        self.packets_retransmitted.fetch_add(1, Ordering::Relaxed);
        self.record_sent(bytes);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }
}
