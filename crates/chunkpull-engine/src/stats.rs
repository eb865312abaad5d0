//! Transfer statistics shared between the loops and the caller.
//! All fields are atomic for lock-free reads while the transfer runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Default)]
pub struct TransferStats {
    /// Total buffer size in bytes.
    pub total_bytes: AtomicU64,
    pub total_chunks: AtomicU64,
    /// Chunks written into the store (duplicates excluded).
    pub chunks_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub requests: AtomicU64,
    /// Requests for a chunk that had been asked for before.
    pub re_requests: AtomicU64,
    pub fresh_replies: AtomicU64,
    pub stale_replies: AtomicU64,
    pub duplicate_replies: AtomicU64,
    pub corrupted_replies: AtomicU64,
    pub malformed_replies: AtomicU64,
    pub squished_replies: AtomicU64,
    pub receive_timeouts: AtomicU64,
    pub burst_size: AtomicU64,
    pub rtt_us: AtomicU64,
}

/// Point-in-time copy of [`TransferStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub chunks_received: u64,
    pub bytes_received: u64,
    pub requests: u64,
    pub re_requests: u64,
    pub fresh_replies: u64,
    pub stale_replies: u64,
    pub duplicate_replies: u64,
    pub corrupted_replies: u64,
    pub malformed_replies: u64,
    pub squished_replies: u64,
    pub receive_timeouts: u64,
    pub burst_size: u64,
    pub rtt_us: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, bytes: u64, chunks: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
        self.total_chunks.store(chunks, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk(&self, len: usize) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_pacing(&self, burst: usize, rtt: Duration) {
        self.burst_size.store(burst as u64, Ordering::Relaxed);
        self.rtt_us.store(rtt.as_micros() as u64, Ordering::Relaxed);
    }

    /// Progress as a fraction 0.0 - 1.0.
    pub fn progress(&self) -> f64 {
        let total = self.total_bytes.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let done = self.bytes_received.load(Ordering::Relaxed);
        (done as f64 / total as f64).min(1.0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            total_bytes: load(&self.total_bytes),
            total_chunks: load(&self.total_chunks),
            chunks_received: load(&self.chunks_received),
            bytes_received: load(&self.bytes_received),
            requests: load(&self.requests),
            re_requests: load(&self.re_requests),
            fresh_replies: load(&self.fresh_replies),
            stale_replies: load(&self.stale_replies),
            duplicate_replies: load(&self.duplicate_replies),
            corrupted_replies: load(&self.corrupted_replies),
            malformed_replies: load(&self.malformed_replies),
            squished_replies: load(&self.squished_replies),
            receive_timeouts: load(&self.receive_timeouts),
            burst_size: load(&self.burst_size),
            rtt_us: load(&self.rtt_us),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_tracks_received_bytes() {
        let stats = TransferStats::new();
        assert_eq!(stats.progress(), 0.0);

        stats.set_total(3000, 3);
        stats.record_chunk(1448);
        stats.record_chunk(1448);
        let progress = stats.progress();
        assert!((progress - 2896.0 / 3000.0).abs() < 1e-9);

        stats.record_chunk(1448);
        assert_eq!(stats.progress(), 1.0);
    }

    #[test]
    fn snapshot_copies_counters() {
        let stats = TransferStats::new();
        TransferStats::bump(&stats.requests);
        TransferStats::bump(&stats.requests);
        TransferStats::bump(&stats.stale_replies);
        stats.set_pacing(8, Duration::from_micros(1500));

        let snap = stats.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.stale_replies, 1);
        assert_eq!(snap.burst_size, 8);
        assert_eq!(snap.rtt_us, 1500);
    }
}
