//! Transaction records and the dependency graph.
//!
//! Write transactions form a graph whose edges order flushes: an edge from
//! a transaction back to a *preceder* means the preceder's changes must
//! reach the serializer's index no later than the transaction's own. Edges
//! come from write-acquirer succession on a block, from dirtier handoffs
//! without a pre-image snapshot, and from cache-conn chaining.

use std::sync::Arc;

use crate::cache::CacheState;
use crate::page::PageIdx;
use crate::signal::OneShot;
use crate::throttler::ThrottlerAcq;
use crate::types::{BlockId, BlockVersion, Recency};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct TxnId(pub u64);

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct ConnId(pub u64);

/// Flush-set traversal mark. See
/// [`CacheState::maximal_flushable_txn_set`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Mark {
    NotMarked,
    Blue,
    Green,
    Red,
}

/// A dirtied-page record snapshotted off a `current_page`: the pre-flush
/// image of one block at one version. Holds one `ptr_count` on `page`.
pub(crate) struct DirtiedPage {
    pub version: BlockVersion,
    pub block_id: BlockId,
    pub recency: Recency,
    /// `None` when the block was deleted.
    pub page: Option<PageIdx>,
}

/// A recency-only change recorded when a write acquirer exits having
/// touched but not dirtied its block.
pub(crate) struct TouchedPage {
    pub version: BlockVersion,
    pub block_id: BlockId,
    pub recency: Recency,
}

pub(crate) struct PageTxn {
    pub throttler_acq: ThrottlerAcq,
    pub conn: Option<ConnId>,
    pub read_only: bool,
    pub live_acqs: usize,
    /// Duplicate-free: transactions that must flush no later than this one.
    pub preceders: Vec<TxnId>,
    /// Duplicate-free: transactions this one must flush no later than.
    pub subseqers: Vec<TxnId>,
    /// Blocks for which this txn is the current `last_write_acquirer`.
    pub pages_write_acquired_last: Vec<BlockId>,
    /// Blocks for which this txn is the current `last_dirtier`.
    pub pages_dirtied_last: Vec<BlockId>,
    pub snapshotted_dirtied_pages: Vec<DirtiedPage>,
    pub touched_pages: Vec<TouchedPage>,
    pub began_waiting_for_flush: bool,
    pub spawned_flush: bool,
    pub mark: Mark,
    pub flush_complete: Arc<OneShot>,
}

impl PageTxn {
    pub fn new(throttler_acq: ThrottlerAcq, conn: Option<ConnId>, read_only: bool) -> Self {
        Self {
            throttler_acq,
            conn,
            read_only,
            live_acqs: 0,
            preceders: Vec::new(),
            subseqers: Vec::new(),
            pages_write_acquired_last: Vec::new(),
            pages_dirtied_last: Vec::new(),
            snapshotted_dirtied_pages: Vec::new(),
            touched_pages: Vec::new(),
            began_waiting_for_flush: false,
            spawned_flush: false,
            mark: Mark::NotMarked,
            flush_complete: Arc::new(OneShot::new()),
        }
    }

    pub fn dirtied_page_count(&self) -> i64 {
        (self.pages_dirtied_last.len() + self.snapshotted_dirtied_pages.len()) as i64
    }
}

impl CacheState {
    pub(crate) fn create_txn(
        &mut self,
        throttler_acq: ThrottlerAcq,
        conn: Option<ConnId>,
        read_only: bool,
    ) -> TxnId {
        let txn_id = TxnId(self.next_txn_id);
        self.next_txn_id += 1;
        self.txns
            .insert(txn_id, PageTxn::new(throttler_acq, conn, read_only));

        // Replace the connection's newest txn; the chain edge causally
        // orders transactions issued through the same connection.
        if let Some(conn_id) = conn {
            let slot = self
                .conns
                .get_mut(&conn_id)
                .expect("conn is registered")
                .replace(txn_id);
            if let Some(old_id) = slot {
                let old = self.txns.get_mut(&old_id).expect("newest txn is live");
                debug_assert_eq!(old.conn, Some(conn_id));
                old.conn = None;
                self.connect_preceder(txn_id, old_id);
            }
        }
        txn_id
    }

    /// Adds `preceder` to `txn`'s preceders (and `txn` to the preceder's
    /// subseqers), deduplicating. Propagates pre-spawn-flush backward when
    /// `txn` already carries it.
    pub(crate) fn connect_preceder(&mut self, txn_id: TxnId, preceder_id: TxnId) {
        assert_ne!(txn_id, preceder_id, "txn cannot precede itself");
        let preceder = self.txns.get(&preceder_id).expect("preceder is live");
        // spawned_flush is set at the same time a txn leaves the graph, so
        // edges to it can no longer appear.
        assert!(!preceder.spawned_flush);

        let txn = self.txns.get_mut(&txn_id).expect("txn is live");
        if txn.preceders.contains(&preceder_id) {
            return;
        }
        txn.preceders.push(preceder_id);
        let pre_spawn = txn.throttler_acq.pre_spawn_flush();
        self.txns
            .get_mut(&preceder_id)
            .expect("preceder is live")
            .subseqers
            .push(txn_id);
        if pre_spawn {
            self.propagate_pre_spawn_flush(preceder_id);
        }
    }

    /// Marks `base` and, transitively, all of its preceders as
    /// pre-spawn-flush. From then on their dirtier handoffs snapshot the
    /// pre-image instead of growing the graph, which bounds flush work.
    pub(crate) fn propagate_pre_spawn_flush(&mut self, base_id: TxnId) {
        {
            let base = self.txns.get_mut(&base_id).expect("txn is live");
            if base.throttler_acq.pre_spawn_flush() {
                return;
            }
            let count = base.dirtied_page_count();
            base.throttler_acq.set_pre_spawn_flush(count);
        }
        // Every stacked txn has pre_spawn_flush freshly set, so no txn is
        // pushed twice.
        let mut stack = vec![base_id];
        while let Some(txn_id) = stack.pop() {
            let preceders = self.txns.get(&txn_id).expect("txn is live").preceders.clone();
            for prec_id in preceders {
                let prec = self.txns.get_mut(&prec_id).expect("preceder is live");
                if !prec.throttler_acq.pre_spawn_flush() {
                    let count = prec.dirtied_page_count();
                    prec.throttler_acq.set_pre_spawn_flush(count);
                    stack.push(prec_id);
                }
            }
        }
    }

    /// Records a write acquirer's exit. Dirty exits need no extra record
    /// (the current_page's dirtier chain holds the change); touched exits
    /// record a recency-only entry.
    pub(crate) fn txn_remove_acquirer(
        &mut self,
        txn_id: TxnId,
        block_id: BlockId,
        version: BlockVersion,
        dirtied: bool,
        touched: bool,
    ) {
        let recency = self.recency_for_block(block_id);
        let txn = self.txns.get_mut(&txn_id).expect("txn is live");
        assert!(txn.live_acqs > 0);
        txn.live_acqs -= 1;
        if dirtied {
            // The current_page's last-dirtier chain carries the change.
        } else if touched {
            // Two touched entries for the same block are fine; the change
            // merge keeps the newer version.
            txn.touched_pages.push(TouchedPage {
                version,
                block_id,
                recency,
            });
        }
    }

    /// Reaps a read-only transaction. Read txns never join the flush graph
    /// and are destroyed on this path alone.
    pub(crate) fn end_read_txn(&mut self, txn_id: TxnId) {
        let txn = self.txns.remove(&txn_id).expect("txn is live");
        assert!(txn.read_only);
        assert_eq!(txn.live_acqs, 0);
        assert!(txn.preceders.is_empty());
        assert!(txn.subseqers.is_empty());
        assert!(!txn.began_waiting_for_flush);
    }
}
