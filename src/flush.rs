//! The flush engine.
//!
//! Committed transactions wait on a list until a maximal causally-closed
//! set of them can be flushed together. A flush coalesces the set's
//! per-block changes (newest version wins), writes modified blocks through
//! the serializer, then applies one index write whose in-memory-update
//! callback repoints block tokens and releases the transactions' pinned
//! pre-images. Index writes commit in flush-spawn order through a FIFO
//! gate and a mutex around the serializer call.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::cache::{CacheShared, CacheState};
use crate::page::PageIdx;
use crate::serializer::{BufWrite, IndexWriteOp};
use crate::signal::OneShot;
use crate::stats::CacheStats;
use crate::txn::{Mark, TxnId};
use crate::types::{BlockId, BlockVersion, Durability, Recency};

/// One block's coalesced change within a flush set.
pub(crate) struct BlockChange {
    pub version: BlockVersion,
    pub modified: bool,
    /// Bytes to write; `None` on a modified change means deletion.
    pub page: Option<PageIdx>,
    pub recency: Recency,
}

pub(crate) struct FlushJob {
    txns: Vec<TxnId>,
    changes: HashMap<BlockId, BlockChange>,
    ticket: u64,
}

/// Orders index writes by flush-spawn ticket. A flush holds its turn until
/// it has the serializer mutex, so index writes commit in the order their
/// flushes were spawned.
#[derive(Default)]
pub(crate) struct IndexWriteGate {
    next_ticket: Mutex<u64>,
    served: Mutex<u64>,
    cv: Condvar,
}

impl IndexWriteGate {
    pub fn enter(&self) -> u64 {
        let mut next = self.next_ticket.lock();
        let ticket = *next;
        *next += 1;
        ticket
    }

    fn wait_turn(&self, ticket: u64) {
        let mut served = self.served.lock();
        while *served != ticket {
            self.cv.wait(&mut served);
        }
    }

    fn leave(&self) {
        let mut served = self.served.lock();
        *served += 1;
        self.cv.notify_all();
    }
}

impl CacheState {
    /// The largest flushable set containing `base`: every member has
    /// committed (`began_waiting_for_flush`), and every preceder of a
    /// member is also a member. Transactions with an uncommitted preceder
    /// poison their subseqers transitively.
    ///
    /// Four-state marking: blue nodes are queued for a visit; a visit
    /// turns them red (poisoned) when some preceder is red or not yet
    /// waiting, green otherwise. A green node that later gains a red
    /// preceder is re-queued, so each node is visited at most twice.
    pub(crate) fn maximal_flushable_txn_set(&mut self, base_id: TxnId) -> Vec<TxnId> {
        let mut blue: Vec<TxnId> = Vec::new();
        let mut colored: Vec<TxnId> = Vec::new();

        {
            let base = self.txns.get_mut(&base_id).expect("base txn is live");
            assert!(!base.spawned_flush);
            assert!(base.began_waiting_for_flush);
            debug_assert_eq!(base.mark, Mark::NotMarked);
            base.mark = Mark::Blue;
        }
        blue.push(base_id);
        colored.push(base_id);

        while let Some(txn_id) = blue.pop() {
            let (preceders, subseqers) = {
                let txn = self.txns.get(&txn_id).expect("txn is live");
                debug_assert!(!txn.spawned_flush);
                debug_assert!(txn.began_waiting_for_flush);
                debug_assert_eq!(txn.mark, Mark::Blue);
                (txn.preceders.clone(), txn.subseqers.clone())
            };

            let mut poisoned = false;
            for prec_id in preceders {
                let prec = self.txns.get_mut(&prec_id).expect("preceder is live");
                debug_assert!(!prec.spawned_flush);
                if !prec.began_waiting_for_flush || prec.mark == Mark::Red {
                    poisoned = true;
                } else if prec.mark == Mark::NotMarked {
                    prec.mark = Mark::Blue;
                    blue.push(prec_id);
                    colored.push(prec_id);
                } else {
                    debug_assert!(prec.mark == Mark::Green || prec.mark == Mark::Blue);
                }
            }

            self.txns.get_mut(&txn_id).expect("txn is live").mark =
                if poisoned { Mark::Red } else { Mark::Green };

            for subs_id in subseqers {
                let subs = self.txns.get_mut(&subs_id).expect("subseqer is live");
                debug_assert!(!subs.spawned_flush);
                if !subs.began_waiting_for_flush {
                    debug_assert_eq!(subs.mark, Mark::NotMarked);
                } else if subs.mark == Mark::NotMarked {
                    if !poisoned {
                        subs.mark = Mark::Blue;
                        blue.push(subs_id);
                        colored.push(subs_id);
                    }
                } else if subs.mark == Mark::Green {
                    if poisoned {
                        subs.mark = Mark::Blue;
                        blue.push(subs_id);
                    }
                } else {
                    debug_assert!(subs.mark == Mark::Red || subs.mark == Mark::Blue);
                }
            }
        }

        let mut flushable = Vec::with_capacity(colored.len());
        for txn_id in colored {
            let txn = self.txns.get_mut(&txn_id).expect("txn is live");
            let mark = txn.mark;
            txn.mark = Mark::NotMarked;
            if mark == Mark::Green {
                flushable.push(txn_id);
            } else {
                debug_assert_eq!(mark, Mark::Red);
            }
        }
        flushable
    }

    /// Detaches a flush set from the graph. Edges vanish, last-acquirer
    /// and last-dirtier pointers are cleared (the latter snapshotting the
    /// page first), conn back-pointers are nulled, and `spawned_flush` is
    /// set in the same step so `connect_preceder` can rely on it.
    pub(crate) fn remove_txn_set_from_graph(&mut self, txns: &[TxnId]) {
        for &txn_id in txns {
            let (subseqers, preceders, write_acquired, dirtied_last, conn) = {
                let txn = self.txns.get_mut(&txn_id).expect("txn is live");
                (
                    std::mem::take(&mut txn.subseqers),
                    std::mem::take(&mut txn.preceders),
                    std::mem::take(&mut txn.pages_write_acquired_last),
                    std::mem::take(&mut txn.pages_dirtied_last),
                    txn.conn.take(),
                )
            };

            for subs_id in subseqers {
                let subs = self.txns.get_mut(&subs_id).expect("subseqer is live");
                subs.preceders.retain(|&p| p != txn_id);
            }
            // Preceders outside the set exist: transactions that make no
            // modifications are not flushed and do not wait for their
            // preceders to leave the graph.
            for prec_id in preceders {
                let prec = self.txns.get_mut(&prec_id).expect("preceder is live");
                prec.subseqers.retain(|&s| s != txn_id);
            }

            for block_id in write_acquired {
                let cp = self
                    .current_pages
                    .get_mut(&block_id)
                    .expect("current page exists");
                debug_assert_eq!(cp.last_write_acquirer, Some(txn_id));
                cp.last_write_acquirer = None;
                self.consider_evicting_current_page(block_id);
            }

            for block_id in dirtied_last {
                let (version, recency) = {
                    let cp = self
                        .current_pages
                        .get_mut(&block_id)
                        .expect("current page exists");
                    debug_assert_eq!(cp.last_dirtier, Some(txn_id));
                    cp.last_dirtier = None;
                    (cp.last_dirtier_version, cp.last_dirtier_recency)
                };
                let page = self.snapshot_page_ref_or_deleted(block_id);
                self.txns
                    .get_mut(&txn_id)
                    .expect("txn is live")
                    .snapshotted_dirtied_pages
                    .push(crate::txn::DirtiedPage {
                        version,
                        block_id,
                        recency,
                        page,
                    });
                self.consider_evicting_current_page(block_id);
            }

            if let Some(conn_id) = conn {
                let slot = self.conns.get_mut(&conn_id).expect("conn is registered");
                debug_assert_eq!(*slot, Some(txn_id));
                *slot = None;
            }

            let txn = self.txns.get_mut(&txn_id).expect("txn is live");
            assert!(!txn.spawned_flush);
            txn.spawned_flush = true;
            self.waiting_for_spawn_flush.retain(|&t| t != txn_id);
        }
    }

    /// Coalesces the set's changes per block. Dirtied entries feed first
    /// and resolve conflicts by the higher version; touched entries never
    /// shadow a dirtied page's bytes, only its version and recency.
    pub(crate) fn compute_changes(&self, txns: &[TxnId]) -> HashMap<BlockId, BlockChange> {
        let mut changes: HashMap<BlockId, BlockChange> = HashMap::new();

        for &txn_id in txns {
            let txn = &self.txns[&txn_id];
            for dirtied in &txn.snapshotted_dirtied_pages {
                let change = BlockChange {
                    version: dirtied.version,
                    modified: true,
                    page: dirtied.page,
                    recency: dirtied.recency,
                };
                match changes.entry(dirtied.block_id) {
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(change);
                    }
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        // Distinct writes can never share a version.
                        assert_ne!(entry.get().version, change.version);
                        if entry.get().version < change.version {
                            entry.insert(change);
                        }
                    }
                }
            }
        }

        for &txn_id in txns {
            let txn = &self.txns[&txn_id];
            for touched in &txn.touched_pages {
                match changes.entry(touched.block_id) {
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(BlockChange {
                            version: touched.version,
                            modified: false,
                            page: None,
                            recency: touched.recency,
                        });
                    }
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        let change = entry.get_mut();
                        assert_ne!(change.version, touched.version);
                        if change.version < touched.version {
                            debug_assert_eq!(
                                touched.recency,
                                Recency::superseding(change.recency, touched.recency)
                            );
                            change.recency = touched.recency;
                            change.version = touched.version;
                        }
                    }
                }
            }
        }

        changes
    }
}

/// Commits the transaction to the flush machinery. Returns the latch the
/// caller may wait on for hard durability.
pub(crate) fn begin_waiting_for_flush(
    shared: &Arc<CacheShared>,
    txn_id: TxnId,
    durability: Durability,
) -> Arc<OneShot> {
    let mut state = shared.state.lock();
    let latch = {
        let txn = state.txns.get_mut(&txn_id).expect("txn is live");
        assert_eq!(
            txn.live_acqs, 0,
            "an acquirer outlived its transaction's commit"
        );
        assert!(!txn.began_waiting_for_flush);
        assert!(!txn.spawned_flush);
        txn.began_waiting_for_flush = true;
        Arc::clone(&txn.flush_complete)
    };
    state.waiting_for_spawn_flush.push(txn_id);

    if durability.is_hard() || state.txns[&txn_id].throttler_acq.pre_spawn_flush() {
        state.propagate_pre_spawn_flush(txn_id);
    }
    let flush_set = state.maximal_flushable_txn_set(txn_id);
    spawn_flush_flushables(shared, &mut state, flush_set);
    latch
}

/// Detaches and flushes a set. Empty change sets complete inline; anything
/// else runs on its own flush thread.
pub(crate) fn spawn_flush_flushables(
    shared: &Arc<CacheShared>,
    state: &mut CacheState,
    flush_set: Vec<TxnId>,
) {
    if flush_set.is_empty() {
        return;
    }
    state.remove_txn_set_from_graph(&flush_set);
    let changes = state.compute_changes(&flush_set);
    debug!(
        txns = flush_set.len(),
        changes = changes.len(),
        "cache.flush.spawn"
    );
    if changes.is_empty() {
        pulse_flush_complete(state, &flush_set);
        return;
    }

    let ticket = shared.index_write_gate.enter();
    let job = FlushJob {
        txns: flush_set,
        changes,
        ticket,
    };
    shared.drainer.enter();
    let worker = Arc::clone(shared);
    thread::spawn(move || {
        do_flush_changes(&worker, job);
        worker.drainer.exit();
    });
}

/// Drives one flush set through the serializer.
fn do_flush_changes(shared: &Arc<CacheShared>, job: FlushJob) {
    CacheStats::bump(&shared.stats.flushes);

    let mut ops: Vec<IndexWriteOp> = Vec::with_capacity(job.changes.len());
    let mut write_infos: Vec<BufWrite> = Vec::new();
    // (block id, page, recency) for each queued buffer write, index-aligned
    // with `write_infos` and the tokens that come back.
    let mut written: Vec<(BlockId, PageIdx, Recency)> = Vec::new();

    {
        let state = shared.state.lock();
        for (&block_id, change) in &job.changes {
            if change.modified {
                match change.page {
                    None => ops.push(IndexWriteOp::tombstone(block_id)),
                    Some(idx) => {
                        let page = state.pages.get(idx);
                        if let Some(token) = page.token {
                            // The on-disk image still matches: reuse it.
                            ops.push(IndexWriteOp::write(block_id, token, change.recency));
                        } else {
                            // A dirtied page is necessarily resident: the
                            // bytes were mutated through a write guard and
                            // eviction refuses unbacked pages.
                            assert!(page.is_loaded());
                            write_infos.push(BufWrite {
                                block_id,
                                buf: Arc::clone(page.buf.as_ref().expect("loaded page has bytes")),
                            });
                            written.push((block_id, idx, change.recency));
                        }
                    }
                }
            } else {
                ops.push(IndexWriteOp::touch(block_id, change.recency));
            }
        }
    }

    let tokens = if write_infos.is_empty() {
        Vec::new()
    } else {
        match shared
            .serializer
            .block_writes(&write_infos, &shared.writes_account)
        {
            Ok(tokens) => tokens,
            Err(err) => {
                error!(error = %err, "cache.flush.block_writes_failed");
                std::process::abort();
            }
        }
    };
    assert_eq!(tokens.len(), written.len());
    CacheStats::add(&shared.stats.blocks_written, tokens.len() as u64);
    for (&(block_id, _, recency), &token) in written.iter().zip(tokens.iter()) {
        ops.push(IndexWriteOp::write(block_id, token, recency));
    }

    // Index writes commit in spawn order: hold the ticket until the
    // serializer mutex is ours.
    shared.index_write_gate.wait_turn(job.ticket);
    let mutex_guard = shared.index_write_mutex.lock();
    shared.index_write_gate.leave();

    assert!(!ops.is_empty());
    let result = shared.serializer.index_write(&ops, &mut || {
        // The serializer's in-memory index now reflects the ops; its disk
        // image may not yet. Repoint tokens and release the pinned
        // pre-images here, before durability.
        let mut state = shared.state.lock();
        for (&(_, idx, _), &token) in written.iter().zip(tokens.iter()) {
            let page = state.pages.get_mut(idx);
            debug_assert!(page.token.is_none());
            page.token = Some(token);
            state.refresh_page(idx);
        }
        for &txn_id in &job.txns {
            let dirtied = {
                let txn = state.txns.get_mut(&txn_id).expect("txn is live");
                std::mem::take(&mut txn.snapshotted_dirtied_pages)
            };
            for entry in dirtied {
                if let Some(idx) = entry.page {
                    state.release_page_ref(idx);
                }
                state.consider_evicting_current_page(entry.block_id);
            }
            state
                .txns
                .get_mut(&txn_id)
                .expect("txn is live")
                .throttler_acq
                .mark_dirty_pages_written();
        }
        state.evict_if_needed(&shared.stats);
    });
    drop(mutex_guard);

    if let Err(err) = result {
        error!(error = %err, "cache.flush.index_write_failed");
        std::process::abort();
    }

    let mut state = shared.state.lock();
    pulse_flush_complete(&mut state, &job.txns);
    debug!(txns = job.txns.len(), "cache.flush.complete");
}

/// Wakes completion waiters and destroys the flushed transactions. The
/// throttler's index reservation releases with the transaction.
pub(crate) fn pulse_flush_complete(state: &mut CacheState, txns: &[TxnId]) {
    for &txn_id in txns {
        let txn = state.txns.remove(&txn_id).expect("txn is live");
        debug_assert!(txn.preceders.is_empty());
        debug_assert!(txn.subseqers.is_empty());
        debug_assert!(txn.snapshotted_dirtied_pages.is_empty());
        txn.flush_complete.pulse();
    }
}
