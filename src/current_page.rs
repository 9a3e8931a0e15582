//! Per-block access arbitration.
//!
//! Each live block id of interest owns one [`CurrentPage`]: a FIFO queue
//! of acquirers plus bookkeeping about the most recent write acquirer and
//! dirtier. The first acquirer is always readable; a writer is writable
//! only at the head of the queue. Snapshot-declared readers are lifted out
//! of the queue as soon as they become readable, capturing the block's
//! bytes and recency as of that moment.

use std::sync::Arc;

use tracing::debug;

use crate::cache::CacheState;
use crate::page::{Page, PageIdx};
use crate::signal::OneShot;
use crate::txn::{DirtiedPage, TxnId};
use crate::types::{Access, BlockId, BlockVersion, Recency};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct AcqId(pub u64);

/// The stable view captured when a snapshot reader is lifted from the
/// acquirer queue. Holds one `ptr_count` on `page`.
#[derive(Copy, Clone)]
pub(crate) struct SnappedPage {
    pub recency: Recency,
    /// `None` when the block was deleted.
    pub page: Option<PageIdx>,
}

pub(crate) struct AcqState {
    pub block_id: BlockId,
    /// Set for write acquirers only; readers are anonymous to the graph.
    pub txn: Option<TxnId>,
    pub access: Access,
    pub declared_snapshotted: bool,
    pub block_version: BlockVersion,
    pub read_cond: Arc<OneShot>,
    pub write_cond: Arc<OneShot>,
    pub dirtied_page: bool,
    pub touched_page: bool,
    pub snapshotted_page: Option<SnappedPage>,
}

pub(crate) struct CurrentPage {
    pub block_id: BlockId,
    pub page: Option<PageIdx>,
    pub is_deleted: bool,
    pub last_write_acquirer: Option<TxnId>,
    pub last_write_acquirer_version: BlockVersion,
    pub last_dirtier: Option<TxnId>,
    pub last_dirtier_version: BlockVersion,
    pub last_dirtier_recency: Recency,
    pub num_keepalives: u64,
    /// FIFO; entries are removed from the middle only by snapshot lifting.
    pub acquirers: Vec<AcqId>,
}

impl CurrentPage {
    pub fn new(block_id: BlockId, page: Option<PageIdx>) -> Self {
        Self {
            block_id,
            page,
            is_deleted: false,
            last_write_acquirer: None,
            // Start above zero so assigned acquirer versions are
            // distinguishable from the unassigned value.
            last_write_acquirer_version: BlockVersion::UNASSIGNED.subsequent(),
            last_dirtier: None,
            last_dirtier_version: BlockVersion::UNASSIGNED,
            last_dirtier_recency: Recency::INVALID,
            num_keepalives: 0,
            acquirers: Vec::new(),
        }
    }
}

impl CacheState {
    /// Ensures a `current_page` exists for `block_id`, creating a
    /// disk-backed one on first interest.
    pub(crate) fn page_for_block_id(&mut self, block_id: BlockId) {
        if let Some(cp) = self.current_pages.get(&block_id) {
            assert!(!cp.is_deleted, "acquired a deleted block");
            return;
        }
        assert!(
            block_id.is_aux() || self.recency_for_block(block_id).is_valid(),
            "block {block_id} does not exist (create it instead)"
        );
        self.current_pages
            .insert(block_id, CurrentPage::new(block_id, None));
    }

    /// Installs a freshly created block under `block_id`: zeroed resident
    /// bytes, recency `DISTANT_PAST`, nothing on disk yet.
    pub(crate) fn page_for_new_chosen(&mut self, block_id: BlockId, block_size: usize) {
        assert!(
            block_id.is_aux() || !self.recency_for_block(block_id).is_valid(),
            "chosen block {block_id} is not deleted"
        );
        if !block_id.is_aux() {
            self.set_recency_for_block(block_id, Recency::DISTANT_PAST);
        }
        let idx = self.pages.insert(Page::new_resident(block_id, block_size));
        self.touch_page_access(idx);
        let existing = self
            .current_pages
            .insert(block_id, CurrentPage::new(block_id, Some(idx)));
        assert!(existing.is_none(), "created block already has a current page");
        debug!(%block_id, "cache.block_created");
    }

    /// The page slot backing `block_id`'s current page, created as
    /// disk-backed on demand.
    pub(crate) fn ensure_page_slot(&mut self, block_id: BlockId) -> PageIdx {
        let cp = self
            .current_pages
            .get(&block_id)
            .expect("current page exists");
        assert!(!cp.is_deleted);
        if let Some(idx) = cp.page {
            return idx;
        }
        let idx = self.pages.insert(Page::new_disk_backed(block_id, None));
        self.refresh_page(idx);
        self.current_pages
            .get_mut(&block_id)
            .expect("current page exists")
            .page = Some(idx);
        idx
    }

    /// Takes a snapshot reference to the block's current page: `None` when
    /// the block is deleted, otherwise a `ptr_count`-holding index.
    pub(crate) fn snapshot_page_ref_or_deleted(&mut self, block_id: BlockId) -> Option<PageIdx> {
        let cp = self
            .current_pages
            .get(&block_id)
            .expect("current page exists");
        if cp.is_deleted {
            return None;
        }
        let idx = self.ensure_page_slot(block_id);
        self.pages.get_mut(idx).ptr_count += 1;
        self.refresh_page(idx);
        Some(idx)
    }

    /// Drops one `ptr_count` on a page, freeing the slot on the last one.
    pub(crate) fn release_page_ref(&mut self, idx: PageIdx) {
        let page = self.pages.get_mut(idx);
        assert!(page.ptr_count > 0);
        page.ptr_count -= 1;
        if page.ptr_count == 0 {
            self.evicter.forget(idx);
            self.pages.remove(idx);
        } else {
            self.refresh_page(idx);
        }
    }

    /// Re-derives a page's eviction bag after a state change.
    pub(crate) fn refresh_page(&mut self, idx: PageIdx) {
        let page = self.pages.get(idx);
        self.evicter.refresh(idx, page);
    }

    pub(crate) fn touch_page_access(&mut self, idx: PageIdx) {
        self.access_clock += 1;
        let clock = self.access_clock;
        self.pages.get_mut(idx).last_access = clock;
        self.refresh_page(idx);
    }

    pub(crate) fn add_keepalive(&mut self, block_id: BlockId) {
        self.current_pages
            .get_mut(&block_id)
            .expect("current page exists")
            .num_keepalives += 1;
    }

    pub(crate) fn remove_keepalive(&mut self, block_id: BlockId) {
        let cp = self
            .current_pages
            .get_mut(&block_id)
            .expect("current page exists");
        assert!(cp.num_keepalives > 0);
        cp.num_keepalives -= 1;
    }

    /// Enqueues an acquirer. Writers bump the block version and take over
    /// as last write acquirer, chaining a preceder edge to the previous
    /// one when it belongs to a different transaction.
    pub(crate) fn add_acquirer(&mut self, block_id: BlockId, acq_id: AcqId) {
        let prev_version = self
            .current_pages
            .get(&block_id)
            .expect("current page exists")
            .last_write_acquirer_version;
        let (access, acq_txn) = {
            let acq = self.acqs.get(&acq_id).expect("acq is live");
            (acq.access, acq.txn)
        };

        if access == Access::Write {
            let version = prev_version.subsequent();
            self.acqs
                .get_mut(&acq_id)
                .expect("acq is live")
                .block_version = version;
            let acq_txn = acq_txn.expect("write acq has a txn");

            let cp = self
                .current_pages
                .get_mut(&block_id)
                .expect("current page exists");
            cp.last_write_acquirer_version = version;
            let prev_acquirer = cp.last_write_acquirer;

            if prev_acquirer != Some(acq_txn) {
                if let Some(prec_id) = prev_acquirer {
                    let prec = self.txns.get_mut(&prec_id).expect("preceder is live");
                    let pos = prec
                        .pages_write_acquired_last
                        .iter()
                        .position(|&b| b == block_id)
                        .expect("preceder tracks this block");
                    prec.pages_write_acquired_last.swap_remove(pos);
                    self.connect_preceder(acq_txn, prec_id);
                }
                self.txns
                    .get_mut(&acq_txn)
                    .expect("txn is live")
                    .pages_write_acquired_last
                    .push(block_id);
                self.current_pages
                    .get_mut(&block_id)
                    .expect("current page exists")
                    .last_write_acquirer = Some(acq_txn);
            }
        } else {
            debug_assert!(acq_txn.is_none(), "read acqs are anonymous");
            self.acqs
                .get_mut(&acq_id)
                .expect("acq is live")
                .block_version = prev_version;
        }

        self.current_pages
            .get_mut(&block_id)
            .expect("current page exists")
            .acquirers
            .push(acq_id);
        self.pulse_pulsables(block_id, acq_id);
    }

    /// Dequeues an acquirer and wakes whatever its departure unblocks.
    pub(crate) fn remove_acquirer(&mut self, block_id: BlockId, acq_id: AcqId) {
        let next = {
            let cp = self
                .current_pages
                .get_mut(&block_id)
                .expect("current page exists");
            let pos = cp
                .acquirers
                .iter()
                .position(|&a| a == acq_id)
                .expect("acq is queued");
            cp.acquirers.remove(pos);
            cp.acquirers.get(pos).copied()
        };
        if let Some(next_id) = next {
            self.pulse_pulsables(block_id, next_id);
        }
    }

    /// Walks the queue from `acq_id`, pulsing readiness. Readers become
    /// readable once every preceder is a pulsed reader; snapshot-declared
    /// readers are lifted out with a stable page reference; a writer at
    /// the head becomes writable and the walk stops.
    pub(crate) fn pulse_pulsables(&mut self, block_id: BlockId, acq_id: AcqId) {
        let pos = {
            let cp = self
                .current_pages
                .get(&block_id)
                .expect("current page exists");
            cp.acquirers
                .iter()
                .position(|&a| a == acq_id)
                .expect("acq is queued")
        };

        // Nothing to pulse while a preceder is unpulsed or a writer.
        if pos > 0 {
            let prev_id = self.current_pages[&block_id].acquirers[pos - 1];
            let prev = &self.acqs[&prev_id];
            if !(prev.access == Access::Read && prev.read_cond.is_pulsed()) {
                return;
            }
        }

        // Avoid re-walking fully pulsed chains. A pulsed reader may still
        // need lifting if it has since declared itself snapshotted.
        {
            let acq = &self.acqs[&acq_id];
            if acq.access == Access::Read
                && acq.read_cond.is_pulsed()
                && !acq.declared_snapshotted
            {
                match self.current_pages[&block_id].acquirers.get(pos + 1) {
                    None => return,
                    Some(next_id) => {
                        if self.acqs[next_id].read_cond.is_pulsed() {
                            return;
                        }
                    }
                }
            }
        }

        let current_recency = self.recency_for_block(block_id);

        let mut pos = pos;
        loop {
            let Some(&cur_id) = self.current_pages[&block_id].acquirers.get(pos) else {
                break;
            };
            // The previous node reads and has been pulsed, so this node
            // becomes readable.
            self.acqs[&cur_id].read_cond.pulse();
            let (access, declared) = {
                let acq = &self.acqs[&cur_id];
                (acq.access, acq.declared_snapshotted)
            };
            if access == Access::Read {
                if declared {
                    // Snapshotters leave the queue to make way for
                    // write acquirers; a deleted block hands them `None`
                    // so a downgraded writer learns of its own delete.
                    let page = self.snapshot_page_ref_or_deleted(block_id);
                    self.acqs
                        .get_mut(&cur_id)
                        .expect("acq is live")
                        .snapshotted_page = Some(SnappedPage {
                        recency: current_recency,
                        page,
                    });
                    self.current_pages
                        .get_mut(&block_id)
                        .expect("current page exists")
                        .acquirers
                        .remove(pos);
                    // The next acquirer shifted into `pos`.
                } else {
                    pos += 1;
                }
            } else {
                // Even the first write acquirer reads; it writes only with
                // no preceding reader left.
                if pos == 0 {
                    assert!(!self.current_pages[&block_id].is_deleted);
                    self.acqs[&cur_id].write_cond.pulse();
                }
                break;
            }
        }
    }

    /// Hands the block off to the acquirer's transaction as dirtier. If
    /// the previous dirtier is a different transaction it either snapshots
    /// its pre-image (pre-flush state) or becomes unable to flush without
    /// us (a back edge), since without a snapshot it has no bytes of its
    /// own to write.
    pub(crate) fn dirty_the_page(&mut self, acq_id: AcqId) {
        let (block_id, txn_id, version) = {
            let acq = self.acqs.get_mut(&acq_id).expect("acq is live");
            acq.dirtied_page = true;
            (
                acq.block_id,
                acq.txn.expect("write acq has a txn"),
                acq.block_version,
            )
        };

        let (prec, prec_version, prec_recency) = {
            let cp = &self.current_pages[&block_id];
            (
                cp.last_dirtier,
                cp.last_dirtier_version,
                cp.last_dirtier_recency,
            )
        };

        if prec != Some(txn_id) {
            if let Some(prec_id) = prec {
                let pre_spawn = {
                    let prec_txn = self.txns.get_mut(&prec_id).expect("dirtier is live");
                    let pos = prec_txn
                        .pages_dirtied_last
                        .iter()
                        .position(|&b| b == block_id)
                        .expect("dirtier tracks this block");
                    prec_txn.pages_dirtied_last.swap_remove(pos);
                    prec_txn.throttler_acq.pre_spawn_flush()
                };
                if pre_spawn {
                    let page = self.snapshot_page_ref_or_deleted(block_id);
                    self.txns
                        .get_mut(&prec_id)
                        .expect("dirtier is live")
                        .snapshotted_dirtied_pages
                        .push(DirtiedPage {
                            version: prec_version,
                            block_id,
                            recency: prec_recency,
                            page,
                        });
                } else {
                    self.connect_preceder(prec_id, txn_id);
                }
            }
            // Grow our throttler reservation before the preceder's can
            // shrink back down.
            self.txns
                .get_mut(&txn_id)
                .expect("txn is live")
                .pages_dirtied_last
                .push(block_id);
            let count = self.txns[&txn_id].dirtied_page_count();
            self.txns
                .get_mut(&txn_id)
                .expect("txn is live")
                .throttler_acq
                .update_dirty_page_count(count);
            if let Some(prec_id) = prec {
                let count = self.txns[&prec_id].dirtied_page_count();
                self.txns
                    .get_mut(&prec_id)
                    .expect("dirtier is live")
                    .throttler_acq
                    .update_dirty_page_count(count);
            }
        }

        let recency = self.recency_for_block(block_id);
        let cp = self
            .current_pages
            .get_mut(&block_id)
            .expect("current page exists");
        cp.last_dirtier = Some(txn_id);
        cp.last_dirtier_recency = recency;
        cp.last_dirtier_version = version;
    }

    /// Deletes the block: only the sole remaining acquirer may do this,
    /// because later acquirers would otherwise race a block id that has
    /// not returned to the free list yet.
    pub(crate) fn mark_deleted(&mut self, block_id: BlockId) {
        let page = {
            let cp = self
                .current_pages
                .get_mut(&block_id)
                .expect("current page exists");
            assert!(!cp.is_deleted, "double delete");
            assert_eq!(cp.acquirers.len(), 1, "delete with other acquirers queued");
            cp.is_deleted = true;
            cp.page.take()
        };
        self.set_recency_for_block(block_id, Recency::INVALID);
        if let Some(idx) = page {
            self.release_page_ref(idx);
        }
        debug!(%block_id, "cache.block_deleted");
    }

    /// A `current_page` may be dropped only when nothing references it:
    /// no acquirers, no last write acquirer or dirtier, no keepalives, and
    /// its page (if any) is a quiet disk-backed image.
    pub(crate) fn should_be_evicted(&self, block_id: BlockId) -> bool {
        let cp = &self.current_pages[&block_id];
        if !cp.acquirers.is_empty() {
            return false;
        }
        if cp.last_write_acquirer.is_some() {
            return false;
        }
        if cp.last_dirtier.is_some() {
            return false;
        }
        if cp.num_keepalives > 0 {
            return false;
        }
        if let Some(idx) = cp.page {
            let page = self.pages.get(idx);
            if page.is_loading() || page.has_waiters() || page.is_loaded() || page.ptr_count != 1
            {
                return false;
            }
        }
        true
    }

    /// Drops the `current_page` if it qualifies, returning a deleted
    /// block's id to the free list. Held back entirely while read-ahead is
    /// active, because read-ahead uses the existence of a `current_page`
    /// to detect stale offers.
    pub(crate) fn consider_evicting_current_page(&mut self, block_id: BlockId) {
        if self.read_ahead_active {
            return;
        }
        if !self.current_pages.contains_key(&block_id) {
            return;
        }
        if !self.should_be_evicted(block_id) {
            return;
        }
        let cp = self
            .current_pages
            .remove(&block_id)
            .expect("current page exists");
        if let Some(idx) = cp.page {
            self.release_page_ref(idx);
        }
        if cp.is_deleted {
            self.free_list.release_block_id(cp.block_id);
        }
    }
}
