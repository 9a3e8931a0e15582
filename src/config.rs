use crate::throttler::MINIMUM_SOFT_UNWRITTEN_CHANGES_LIMIT;

/// Default I/O priority of unaccounted cache reads.
pub const CACHE_READS_IO_PRIORITY: i32 = 16;

/// Configuration for a [`crate::PageCache`].
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Memory budget for resident block bytes; also feeds the throttler
    /// capacity computation.
    pub memory_limit: u64,
    /// Whether to accept serializer read-ahead offers at startup.
    pub start_read_ahead: bool,
    /// Floor for the throttler capacity, regardless of memory budget.
    pub minimum_unwritten_changes: i64,
    /// I/O priority used by the default reads account.
    pub reads_io_priority: i32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            start_read_ahead: true,
            minimum_unwritten_changes: MINIMUM_SOFT_UNWRITTEN_CHANGES_LIMIT,
            reads_io_priority: CACHE_READS_IO_PRIORITY,
        }
    }
}
