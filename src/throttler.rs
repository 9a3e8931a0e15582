//! Write-transaction throttling.
//!
//! Two counting semaphores bound the number of unwritten block changes and
//! unwritten index changes held in memory. Transactions that are not
//! completely flushed yet consume memory for index-write metadata in
//! addition to the block bytes themselves, so the index semaphore is capped
//! at a fixed multiple of the block semaphore.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

pub(crate) const MINIMUM_SOFT_UNWRITTEN_CHANGES_LIMIT: i64 = 1;
pub(crate) const SOFT_UNWRITTEN_CHANGES_LIMIT: i64 = 8000;
pub(crate) const SOFT_UNWRITTEN_CHANGES_MEMORY_FRACTION: f64 = 0.5;
pub(crate) const INDEX_CHANGES_LIMIT_FACTOR: i64 = 5;

struct SemState {
    capacity: i64,
    in_use: i64,
}

struct SemInner {
    state: Mutex<SemState>,
    cv: Condvar,
}

/// Counting semaphore for unwritten-change accounting.
///
/// A request larger than the whole capacity is admitted once the semaphore
/// is completely empty, so a single oversized transaction can still make
/// progress.
pub(crate) struct UnwrittenSemaphore {
    inner: Arc<SemInner>,
}

impl UnwrittenSemaphore {
    pub fn new(capacity: i64) -> Self {
        assert!(capacity >= 0);
        Self {
            inner: Arc::new(SemInner {
                state: Mutex::new(SemState {
                    capacity,
                    in_use: 0,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Blocks until `count` units fit, then reserves them.
    pub fn acquire(&self, count: i64) -> SemAcq {
        assert!(count >= 0);
        let mut state = self.inner.state.lock();
        while count > 0 && !(state.in_use == 0 || state.in_use + count <= state.capacity) {
            self.inner.cv.wait(&mut state);
        }
        state.in_use += count;
        SemAcq {
            inner: Arc::clone(&self.inner),
            count,
        }
    }

    pub fn set_capacity(&self, capacity: i64) {
        assert!(capacity >= 0);
        let mut state = self.inner.state.lock();
        state.capacity = capacity;
        self.inner.cv.notify_all();
    }

    #[cfg(test)]
    pub fn in_use(&self) -> i64 {
        self.inner.state.lock().in_use
    }
}

/// One reservation against an [`UnwrittenSemaphore`]. Released on drop.
pub(crate) struct SemAcq {
    inner: Arc<SemInner>,
    count: i64,
}

impl SemAcq {
    pub fn count(&self) -> i64 {
        self.count
    }

    /// Re-sizes the reservation in place. Growth never blocks; the
    /// semaphore may temporarily run over capacity, which only delays
    /// later acquirers.
    pub fn change_count(&mut self, new_count: i64) {
        assert!(new_count >= 0);
        let mut state = self.inner.state.lock();
        state.in_use += new_count - self.count;
        debug_assert!(state.in_use >= 0);
        if new_count < self.count {
            self.inner.cv.notify_all();
        }
        self.count = new_count;
    }
}

impl Drop for SemAcq {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.in_use -= self.count;
        debug_assert!(state.in_use >= 0);
        self.inner.cv.notify_all();
    }
}

/// Bounds the outstanding unwritten work held by write transactions.
pub(crate) struct TxnThrottler {
    minimum_unwritten_changes_limit: i64,
    unwritten_block_changes: UnwrittenSemaphore,
    unwritten_index_changes: UnwrittenSemaphore,
}

impl TxnThrottler {
    pub fn new(minimum_unwritten_changes_limit: i64) -> Self {
        Self {
            minimum_unwritten_changes_limit,
            unwritten_block_changes: UnwrittenSemaphore::new(SOFT_UNWRITTEN_CHANGES_LIMIT),
            unwritten_index_changes: UnwrittenSemaphore::new(
                SOFT_UNWRITTEN_CHANGES_LIMIT * INDEX_CHANGES_LIMIT_FACTOR,
            ),
        }
    }

    /// Reserves `expected_change_count` units from both semaphores, index
    /// first then blocks. The ordering is fixed so concurrent begins cannot
    /// deadlock against each other.
    pub fn begin_or_throttle(&self, expected_change_count: i64) -> ThrottlerAcq {
        assert!(expected_change_count >= 0);
        let index_changes = self.unwritten_index_changes.acquire(expected_change_count);
        let block_changes = self.unwritten_block_changes.acquire(expected_change_count);
        ThrottlerAcq {
            index_changes: Some(index_changes),
            block_changes: Some(block_changes),
            expected_change_count,
            pre_spawn_flush: false,
        }
    }

    /// Recomputes both capacities from the memory budget.
    pub fn inform_memory_limit_change(&self, memory_limit: u64, max_block_size: u64) {
        assert!(max_block_size > 0);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let from_memory = ((memory_limit / max_block_size) as f64
            * SOFT_UNWRITTEN_CHANGES_MEMORY_FRACTION) as i64;
        let limit = SOFT_UNWRITTEN_CHANGES_LIMIT
            .min(from_memory)
            .max(self.minimum_unwritten_changes_limit);
        debug!(limit, "throttler.capacity_change");
        self.unwritten_index_changes
            .set_capacity(limit * INDEX_CHANGES_LIMIT_FACTOR);
        self.unwritten_block_changes.set_capacity(limit);
    }

    #[cfg(test)]
    pub fn unwritten_block_changes_in_use(&self) -> i64 {
        self.unwritten_block_changes.in_use()
    }
}

/// A transaction's hold on the throttler. Read transactions carry an empty
/// acquisition.
pub(crate) struct ThrottlerAcq {
    index_changes: Option<SemAcq>,
    block_changes: Option<SemAcq>,
    expected_change_count: i64,
    pre_spawn_flush: bool,
}

impl ThrottlerAcq {
    pub fn none() -> Self {
        Self {
            index_changes: None,
            block_changes: None,
            expected_change_count: 0,
            pre_spawn_flush: false,
        }
    }

    pub fn has_throttler(&self) -> bool {
        self.block_changes.is_some()
    }

    pub fn pre_spawn_flush(&self) -> bool {
        self.pre_spawn_flush
    }

    /// Marks the owning transaction as destined to flush and grows the
    /// reservation to its current dirty-page count.
    pub fn set_pre_spawn_flush(&mut self, dirty_page_count: i64) {
        self.pre_spawn_flush = true;
        self.update_dirty_page_count(dirty_page_count);
    }

    /// Grows the reservation once the transaction is in pre-flush state.
    /// The reservation never shrinks before the flush writes it out.
    pub fn update_dirty_page_count(&mut self, new_count: i64) {
        let new_count = new_count.max(self.expected_change_count);
        let (Some(blocks), Some(index)) = (&mut self.block_changes, &mut self.index_changes)
        else {
            return;
        };
        debug_assert_eq!(blocks.count(), index.count());
        if self.pre_spawn_flush && new_count > blocks.count() {
            blocks.change_count(new_count);
            index.change_count(new_count);
        }
    }

    /// Drops the block-changes reservation once the dirty pages have been
    /// written. The index reservation is held until the transaction fully
    /// retires.
    pub fn mark_dirty_pages_written(&mut self) {
        if let Some(blocks) = &mut self.block_changes {
            blocks.change_count(0);
        }
    }
}
