//! Statistics for watch sessions and request routing

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::registry::ResourceKey;
use crate::session::SessionPhase;

/// Live counters for one watch session
#[derive(Debug, Default)]
pub struct SessionCounters {
    chunks_broadcast: AtomicU64,
    bytes_broadcast: AtomicU64,
    deliveries: AtomicU64,
    write_failures: AtomicU64,
    subscribers_attached: AtomicU64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one chunk read from upstream
    pub fn record_chunk(&self, len: usize) {
        self.chunks_broadcast.fetch_add(1, Ordering::Relaxed);
        self.bytes_broadcast.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Record one successful write to a subscriber
    pub fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one failed write to a subscriber
    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attach(&self) {
        self.subscribers_attached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunks_broadcast(&self) -> u64 {
        self.chunks_broadcast.load(Ordering::Relaxed)
    }

    pub fn bytes_broadcast(&self) -> u64 {
        self.bytes_broadcast.load(Ordering::Relaxed)
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn subscribers_attached(&self) -> u64 {
        self.subscribers_attached.load(Ordering::Relaxed)
    }
}

/// Point-in-time snapshot of a watch session
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Resource key the session serves
    pub key: ResourceKey,
    /// Current lifecycle phase
    pub phase: SessionPhase,
    /// Subscribers attached right now
    pub subscriber_count: usize,
    /// Subscribers ever attached
    pub subscribers_attached: u64,
    /// Chunks read from upstream
    pub chunks_broadcast: u64,
    /// Bytes read from upstream
    pub bytes_broadcast: u64,
    /// Successful subscriber writes
    pub deliveries: u64,
    /// Failed subscriber writes
    pub write_failures: u64,
    /// Time since the session was created
    pub age: Duration,
    /// How long the upstream stream ran, or has run so far
    pub streaming_for: Option<Duration>,
    /// Why the session terminated, if it did
    pub termination_reason: Option<String>,
}

/// Routing counters for the dispatcher
#[derive(Debug, Default)]
pub struct DispatchStats {
    watches: AtomicU64,
    cache_reads: AtomicU64,
    pass_through: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_watch(&self) {
        self.watches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_read(&self) {
        self.cache_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass_through(&self) {
        self.pass_through.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of all counters
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            watches: self.watches.load(Ordering::Relaxed),
            cache_reads: self.cache_reads.load(Ordering::Relaxed),
            pass_through: self.pass_through.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    /// Requests routed to a watch session
    pub watches: u64,
    /// Reads served from the local cache
    pub cache_reads: u64,
    /// Requests passed straight to the upstream
    pub pass_through: u64,
    /// Requests rejected for lack of resource metadata
    pub rejected: u64,
    /// Requests answered with an error
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counters_new() {
        let counters = SessionCounters::new();
        assert_eq!(counters.chunks_broadcast(), 0);
        assert_eq!(counters.bytes_broadcast(), 0);
        assert_eq!(counters.deliveries(), 0);
        assert_eq!(counters.write_failures(), 0);
        assert_eq!(counters.subscribers_attached(), 0);
    }

    #[test]
    fn test_session_counters_record() {
        let counters = SessionCounters::new();
        counters.record_chunk(100);
        counters.record_chunk(28);
        counters.record_delivery();
        counters.record_delivery();
        counters.record_write_failure();
        counters.record_attach();

        assert_eq!(counters.chunks_broadcast(), 2);
        assert_eq!(counters.bytes_broadcast(), 128);
        assert_eq!(counters.deliveries(), 2);
        assert_eq!(counters.write_failures(), 1);
        assert_eq!(counters.subscribers_attached(), 1);
    }

    #[test]
    fn test_dispatch_snapshot() {
        let stats = DispatchStats::new();
        assert_eq!(stats.snapshot(), DispatchSnapshot::default());

        stats.record_watch();
        stats.record_cache_read();
        stats.record_pass_through();
        stats.record_pass_through();
        stats.record_rejected();
        stats.record_error();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.watches, 1);
        assert_eq!(snapshot.cache_reads, 1);
        assert_eq!(snapshot.pass_through, 2);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.errors, 1);
    }
}
