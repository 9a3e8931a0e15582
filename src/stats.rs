use std::sync::atomic::{AtomicU64, Ordering};

/// Counters fed to the perfmon surface. All relaxed; readers take a
/// [`StatsSnapshot`].
#[derive(Default)]
pub struct CacheStats {
    pub(crate) page_loads: AtomicU64,
    pub(crate) page_hits: AtomicU64,
    pub(crate) page_evictions: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) blocks_written: AtomicU64,
    pub(crate) read_ahead_accepted: AtomicU64,
    pub(crate) read_ahead_dropped: AtomicU64,
    pub(crate) txns_begun: AtomicU64,
    pub(crate) txns_committed: AtomicU64,
}

impl CacheStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            page_loads: self.page_loads.load(Ordering::Relaxed),
            page_hits: self.page_hits.load(Ordering::Relaxed),
            page_evictions: self.page_evictions.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            read_ahead_accepted: self.read_ahead_accepted.load(Ordering::Relaxed),
            read_ahead_dropped: self.read_ahead_dropped.load(Ordering::Relaxed),
            txns_begun: self.txns_begun.load(Ordering::Relaxed),
            txns_committed: self.txns_committed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`CacheStats`].
#[derive(Copy, Clone, Debug, Default)]
pub struct StatsSnapshot {
    /// Pages read from the serializer.
    pub page_loads: u64,
    /// Reads served from resident bytes.
    pub page_hits: u64,
    /// Resident byte images dropped by the evicter.
    pub page_evictions: u64,
    /// Flush sets driven to the serializer.
    pub flushes: u64,
    /// Block images handed to `block_writes`.
    pub blocks_written: u64,
    /// Read-ahead offers ingested.
    pub read_ahead_accepted: u64,
    /// Read-ahead offers discarded.
    pub read_ahead_dropped: u64,
    /// Transactions begun.
    pub txns_begun: u64,
    /// Write transactions committed.
    pub txns_committed: u64,
}
