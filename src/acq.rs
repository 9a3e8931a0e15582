//! User-facing block acquirers.
//!
//! A [`CurrentPageAcq`] asserts one claim, read or write, on one block. It
//! owns two one-shot readiness latches: the read latch pulses when every
//! preceding acquirer is a pulsed reader; the write latch pulses when the
//! acquirer is alone at the head of the queue. Byte access suspends on the
//! appropriate latch, then loads the block on demand.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;
use tracing::debug;

use crate::cache::{CacheShared, CacheState, CreateMode};
use crate::current_page::{AcqId, AcqState};
use crate::error::{MareaError, Result};
use crate::page::{LoadState, Page, PageIdx};
use crate::serializer::{IoAccount, PageBuf};
use crate::signal::OneShot;
use crate::txn::TxnId;
use crate::types::{Access, BlockId, BlockType, BlockVersion, Recency};

/// Bytes of a block held for reading. The image is stable for the guard's
/// lifetime even if the page is evicted or copied underneath.
pub struct PageReadGuard {
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
}

impl Deref for PageReadGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Bytes of a block held for mutation.
pub struct PageWriteGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

/// One acquirer's claim on one block.
pub struct CurrentPageAcq {
    shared: Arc<CacheShared>,
    acq_id: AcqId,
    block_id: BlockId,
    txn_id: Option<TxnId>,
    read_cond: Arc<OneShot>,
    write_cond: Arc<OneShot>,
}

impl CurrentPageAcq {
    pub(crate) fn init(
        shared: &Arc<CacheShared>,
        txn_id: Option<TxnId>,
        access: Access,
        create: CreateMode,
    ) -> Self {
        debug_assert!(access == Access::Write || txn_id.is_none());
        let block_size = shared.max_block_size;
        let mut state = shared.state.lock();

        let block_id = match create {
            CreateMode::No(block_id) => {
                state.page_for_block_id(block_id);
                block_id
            }
            CreateMode::Chosen(block_id) => {
                assert!(access == Access::Write);
                state.free_list.acquire_chosen_block_id(block_id);
                state.page_for_new_chosen(block_id, block_size);
                block_id
            }
            CreateMode::New(block_type) => {
                assert!(access == Access::Write);
                let block_id = match block_type {
                    BlockType::Normal => state.free_list.acquire_block_id(),
                    BlockType::Aux => state.free_list.acquire_aux_block_id(),
                };
                state.page_for_new_chosen(block_id, block_size);
                block_id
            }
        };

        let acq_id = state.alloc_acq_id();
        let read_cond = Arc::new(OneShot::new());
        let write_cond = Arc::new(OneShot::new());
        state.acqs.insert(
            acq_id,
            AcqState {
                block_id,
                txn: txn_id,
                access,
                declared_snapshotted: false,
                block_version: BlockVersion::UNASSIGNED,
                read_cond: Arc::clone(&read_cond),
                write_cond: Arc::clone(&write_cond),
                dirtied_page: false,
                touched_page: false,
                snapshotted_page: None,
            },
        );
        if let Some(txn_id) = txn_id {
            state.txns.get_mut(&txn_id).expect("txn is live").live_acqs += 1;
        }
        state.add_acquirer(block_id, acq_id);
        drop(state);

        CurrentPageAcq {
            shared: Arc::clone(shared),
            acq_id,
            block_id,
            txn_id,
            read_cond,
            write_cond,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Pulsed once this acquirer may read.
    pub fn read_ready(&self) -> &OneShot {
        &self.read_cond
    }

    /// Pulsed once this acquirer may write.
    pub fn write_ready(&self) -> &OneShot {
        debug_assert_eq!(self.access(), Access::Write);
        &self.write_cond
    }

    fn access(&self) -> Access {
        let state = self.shared.state.lock();
        state.acqs[&self.acq_id].access
    }

    pub fn dirtied_page(&self) -> bool {
        let state = self.shared.state.lock();
        state.acqs[&self.acq_id].dirtied_page
    }

    pub fn touched_page(&self) -> bool {
        let state = self.shared.state.lock();
        state.acqs[&self.acq_id].touched_page
    }

    pub fn block_version(&self) -> BlockVersion {
        let state = self.shared.state.lock();
        state.acqs[&self.acq_id].block_version
    }

    /// Downgrades a write claim to a read claim, letting the queue advance
    /// past it.
    pub fn declare_readonly(&mut self) {
        let mut state = self.shared.state.lock();
        state.acqs.get_mut(&self.acq_id).expect("acq is live").access = Access::Read;
        let queued = state.current_pages[&self.block_id]
            .acquirers
            .contains(&self.acq_id);
        if queued {
            state.pulse_pulsables(self.block_id, self.acq_id);
        }
    }

    /// Declares this reader a snapshot: once readable it captures the
    /// block's bytes and recency and leaves the queue. Redeclaration is
    /// allowed.
    pub fn declare_snapshotted(&mut self) {
        let mut state = self.shared.state.lock();
        let acq = state.acqs.get_mut(&self.acq_id).expect("acq is live");
        assert_eq!(acq.access, Access::Read, "only readers snapshot");
        if !acq.declared_snapshotted {
            acq.declared_snapshotted = true;
            state.add_keepalive(self.block_id);
            state.pulse_pulsables(self.block_id, self.acq_id);
        }
    }

    /// The block's recency as this acquirer observes it: the snapshot's
    /// captured value, or the live value once readable (writable, for
    /// writers, so the observation cannot straddle the write pulse).
    pub fn recency(&self) -> Recency {
        match self.access() {
            Access::Read => self.read_cond.wait(),
            Access::Write => self.write_cond.wait(),
        }
        let state = self.shared.state.lock();
        if let Some(snap) = &state.acqs[&self.acq_id].snapshotted_page {
            return snap.recency;
        }
        state.recency_for_block(self.block_id)
    }

    /// Stamps a new recency without dirtying the bytes.
    pub fn set_recency(&self, recency: Recency) {
        self.write_cond.wait();
        let mut state = self.shared.state.lock();
        let acq = state.acqs.get_mut(&self.acq_id).expect("acq is live");
        assert_eq!(acq.access, Access::Write);
        acq.touched_page = true;
        let txn = acq.txn;
        state.set_recency_for_block(self.block_id, recency);
        let cp = state
            .current_pages
            .get_mut(&self.block_id)
            .expect("current page exists");
        if cp.last_dirtier == txn {
            cp.last_dirtier_recency = recency;
        }
    }

    /// Deletes the block. Requires this acquirer to be the sole one
    /// queued.
    pub fn mark_deleted(&self) {
        self.write_cond.wait();
        let mut state = self.shared.state.lock();
        debug_assert_eq!(state.acqs[&self.acq_id].access, Access::Write);
        state.dirty_the_page(self.acq_id);
        state.mark_deleted(self.block_id);
    }

    /// The block's bytes for reading, loading them on demand.
    pub fn page_for_read(&self, account: &IoAccount) -> Result<PageReadGuard> {
        self.read_cond.wait();
        let buf = self.loaded_buf_for_read(account)?;
        Ok(PageReadGuard {
            guard: buf.read_arc(),
        })
    }

    /// The block's bytes for mutation, loading them on demand. Marks the
    /// page dirtied and invalidates its on-disk token; snapshot holders
    /// keep the pre-image through a copy-on-write split.
    pub fn page_for_write(&self, account: &IoAccount) -> Result<PageWriteGuard> {
        self.write_cond.wait();
        let buf = self.loaded_buf_for_write(account)?;
        Ok(PageWriteGuard {
            guard: buf.write_arc(),
        })
    }

    fn loaded_buf_for_read(&self, account: &IoAccount) -> Result<PageBuf> {
        loop {
            let mut state = self.shared.state.lock();
            let snapshotted = state.acqs[&self.acq_id].snapshotted_page;
            let idx = match snapshotted {
                Some(snap) => match snap.page {
                    None => return Err(MareaError::Invalid("read of a deleted block")),
                    Some(idx) => idx,
                },
                None => state.ensure_page_slot(self.block_id),
            };
            match self.wait_for_loaded(state, idx, account)? {
                Some(buf) => return Ok(buf),
                None => continue,
            }
        }
    }

    fn loaded_buf_for_write(&self, account: &IoAccount) -> Result<PageBuf> {
        loop {
            let mut state = self.shared.state.lock();
            debug_assert_eq!(state.acqs[&self.acq_id].access, Access::Write);
            state.dirty_the_page(self.acq_id);
            let idx = state.ensure_page_slot(self.block_id);

            if state.pages.get(idx).is_loaded() {
                let idx = self.split_for_write(&mut state, idx);
                state.touch_page_access(idx);
                let page = state.pages.get(idx);
                return Ok(Arc::clone(page.buf.as_ref().expect("loaded page has bytes")));
            }
            // Loading or disk-backed: settle the load, then re-check
            // under a fresh lock.
            self.wait_for_loaded(state, idx, account)?;
        }
    }

    /// Splits the page for mutation when snapshot holders pin the current
    /// bytes, and invalidates the (new) image's token either way: the
    /// bytes are about to diverge from disk.
    fn split_for_write(&self, state: &mut CacheState, idx: PageIdx) -> PageIdx {
        let page = state.pages.get(idx);
        if page.ptr_count > 1 {
            let bytes: Box<[u8]> = {
                let buf = page.buf.as_ref().expect("loaded page has bytes");
                buf.read().clone()
            };
            let copy_idx = state.pages.insert(Page {
                block_id: self.block_id,
                buf: Some(Arc::new(parking_lot::RwLock::new(bytes))),
                token: None,
                state: LoadState::Loaded,
                waiters: Vec::new(),
                ptr_count: 1,
                last_access: 0,
            });
            // The current page moves to the copy; snapshots keep the old
            // image (and its still-valid token).
            let cp = state
                .current_pages
                .get_mut(&self.block_id)
                .expect("current page exists");
            debug_assert_eq!(cp.page, Some(idx));
            cp.page = Some(copy_idx);
            state.pages.get_mut(idx).ptr_count -= 1;
            state.refresh_page(idx);
            state.refresh_page(copy_idx);
            debug!(block_id = %self.block_id, "cache.page_copy_on_write");
            copy_idx
        } else {
            state.pages.get_mut(idx).token = None;
            state.refresh_page(idx);
            idx
        }
    }

    /// Resolves a page to its loaded bytes, performing the serializer read
    /// outside the state lock. Returns `Ok(None)` when the caller must
    /// retry (it waited on a concurrent load, or just finished one).
    fn wait_for_loaded(
        &self,
        mut state: parking_lot::MutexGuard<'_, CacheState>,
        idx: PageIdx,
        account: &IoAccount,
    ) -> Result<Option<PageBuf>> {
        let load_state = state.pages.get(idx).state;
        match load_state {
            LoadState::Loaded => {
                state.touch_page_access(idx);
                crate::stats::CacheStats::bump(&self.shared.stats.page_hits);
                let page = state.pages.get(idx);
                Ok(Some(Arc::clone(
                    page.buf.as_ref().expect("loaded page has bytes"),
                )))
            }
            LoadState::Loading => {
                let latch = Arc::new(OneShot::new());
                state.pages.get_mut(idx).waiters.push(Arc::clone(&latch));
                drop(state);
                latch.wait();
                Ok(None)
            }
            LoadState::DiskBacked => {
                let token = state.pages.get(idx).token;
                state.pages.get_mut(idx).state = LoadState::Loading;
                state.refresh_page(idx);
                drop(state);

                let loaded = self.load_block(token, account);

                let mut state = self.shared.state.lock();
                match loaded {
                    Ok((bytes, token)) => {
                        let page = state.pages.get_mut(idx);
                        debug_assert!(page.is_loading());
                        page.buf = Some(Arc::new(parking_lot::RwLock::new(bytes)));
                        page.token = Some(token);
                        page.state = LoadState::Loaded;
                        for waiter in page.waiters.drain(..) {
                            waiter.pulse();
                        }
                        state.touch_page_access(idx);
                        state.evict_if_needed(&self.shared.stats);
                        crate::stats::CacheStats::bump(&self.shared.stats.page_loads);
                        Ok(None)
                    }
                    Err(err) => {
                        let page = state.pages.get_mut(idx);
                        page.state = LoadState::DiskBacked;
                        for waiter in page.waiters.drain(..) {
                            waiter.pulse();
                        }
                        state.refresh_page(idx);
                        Err(err)
                    }
                }
            }
        }
    }

    fn load_block(
        &self,
        token: Option<crate::serializer::BlockToken>,
        account: &IoAccount,
    ) -> Result<(Box<[u8]>, crate::serializer::BlockToken)> {
        let token = match token {
            Some(token) => token,
            None => self
                .shared
                .serializer
                .token_for_block(self.block_id)?
                .ok_or(MareaError::Corruption("block missing from serializer index"))?,
        };
        let mut bytes = vec![0u8; self.shared.max_block_size];
        self.shared
            .serializer
            .block_read(token, &mut bytes, account)?;
        Ok((bytes.into_boxed_slice(), token))
    }
}

impl Drop for CurrentPageAcq {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();

        let (dirtied, touched, version, declared_snapshotted, in_queue) = {
            let acq = &state.acqs[&self.acq_id];
            let in_queue = state.current_pages[&self.block_id]
                .acquirers
                .contains(&self.acq_id);
            (
                acq.dirtied_page,
                acq.touched_page,
                acq.block_version,
                acq.declared_snapshotted,
                in_queue,
            )
        };

        if let Some(txn_id) = self.txn_id {
            state.txn_remove_acquirer(txn_id, self.block_id, version, dirtied, touched);
        }

        if in_queue {
            // Queued acquirers may be snapshot-declared but cannot have
            // been lifted yet.
            debug_assert!(state.acqs[&self.acq_id].snapshotted_page.is_none());
            state.remove_acquirer(self.block_id, self.acq_id);
        }

        let acq = state.acqs.remove(&self.acq_id).expect("acq is live");
        if declared_snapshotted {
            if let Some(snap) = acq.snapshotted_page {
                if let Some(idx) = snap.page {
                    state.release_page_ref(idx);
                }
            }
            state.remove_keepalive(self.block_id);
        }

        state.consider_evicting_current_page(self.block_id);
    }
}
