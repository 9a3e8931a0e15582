//! The page cache: ownership root for every cached entity, and the
//! user-visible transaction facade.
//!
//! All cache entities live behind one state mutex; every entry point locks
//! it, and every suspension (throttling, readiness, load completion, flush
//! completion) waits outside it. Serializer calls are never made while the
//! state lock is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::acq::CurrentPageAcq;
use crate::config::CacheOptions;
use crate::current_page::{AcqId, AcqState, CurrentPage};
use crate::evicter::Evicter;
use crate::flush::{begin_waiting_for_flush, spawn_flush_flushables, IndexWriteGate};
use crate::free_list::FreeList;
use crate::page::{Page, PageSlab};
use crate::serializer::{BlockToken, IoAccount, ReadAheadSink, Serializer};
use crate::signal::{DrainSignal, Drainer};
use crate::stats::{CacheStats, StatsSnapshot};
use crate::throttler::{ThrottlerAcq, TxnThrottler};
use crate::txn::{ConnId, PageTxn, TxnId};
use crate::types::{Access, BlockId, BlockType, Durability, Recency};

pub(crate) struct CacheState {
    pub current_pages: HashMap<BlockId, CurrentPage>,
    pub txns: HashMap<TxnId, PageTxn>,
    pub acqs: HashMap<AcqId, AcqState>,
    pub pages: PageSlab,
    pub evicter: Evicter,
    pub free_list: FreeList,
    pub recencies: Vec<Recency>,
    pub conns: HashMap<ConnId, Option<TxnId>>,
    pub waiting_for_spawn_flush: Vec<TxnId>,
    pub read_ahead_active: bool,
    pub next_txn_id: u64,
    pub next_acq_id: u64,
    pub next_conn_id: u64,
    pub access_clock: u64,
}

impl CacheState {
    pub(crate) fn recency_for_block(&self, block_id: BlockId) -> Recency {
        if block_id.is_aux() {
            return Recency::DISTANT_PAST;
        }
        self.recencies
            .get(block_id.0 as usize)
            .copied()
            .unwrap_or(Recency::INVALID)
    }

    pub(crate) fn set_recency_for_block(&mut self, block_id: BlockId, recency: Recency) {
        if block_id.is_aux() {
            return;
        }
        let index = block_id.0 as usize;
        if index >= self.recencies.len() {
            self.recencies.resize(index + 1, Recency::INVALID);
        }
        self.recencies[index] = recency;
    }

    pub(crate) fn alloc_acq_id(&mut self) -> AcqId {
        let id = AcqId(self.next_acq_id);
        self.next_acq_id += 1;
        id
    }

    /// Drops resident bytes of disk-backed pages until the budget holds.
    pub(crate) fn evict_if_needed(&mut self, stats: &CacheStats) {
        while self.evicter.over_budget() {
            let Some(idx) = self.evicter.pick_victim() else {
                break;
            };
            let page = self.pages.get_mut(idx);
            debug_assert!(page.token.is_some());
            let block_id = page.block_id;
            page.buf = None;
            page.state = crate::page::LoadState::DiskBacked;
            self.refresh_page(idx);
            debug!(
                %block_id,
                resident_bytes = self.evicter.in_memory_bytes(),
                "cache.page_evicted"
            );
            CacheStats::bump(&stats.page_evictions);
        }
    }
}

pub(crate) struct CacheShared {
    pub state: Mutex<CacheState>,
    pub throttler: TxnThrottler,
    pub serializer: Arc<dyn Serializer>,
    pub drain: DrainSignal,
    pub drainer: Drainer,
    pub stats: CacheStats,
    pub max_block_size: usize,
    pub default_reads_account: IoAccount,
    pub writes_account: IoAccount,
    pub index_write_gate: IndexWriteGate,
    pub index_write_mutex: Mutex<()>,
}

/// A transactional cache of fixed-size blocks over a [`Serializer`].
pub struct PageCache {
    shared: Arc<CacheShared>,
}

impl PageCache {
    pub fn new(serializer: Arc<dyn Serializer>, options: CacheOptions) -> Self {
        let max_block_size = serializer.max_block_size();
        let recencies = serializer.get_all_recencies();
        let mut free_list =
            FreeList::new(serializer.end_block_id(), serializer.end_aux_block_index());
        debug_assert_eq!(recencies.len() as u64, serializer.end_block_id());
        for (index, recency) in recencies.iter().enumerate() {
            if !recency.is_valid() {
                free_list.release_block_id(BlockId(index as u64));
            }
        }

        let throttler = TxnThrottler::new(options.minimum_unwritten_changes);
        throttler.inform_memory_limit_change(options.memory_limit, max_block_size as u64);

        let default_reads_account = serializer.make_io_account(options.reads_io_priority, 16);
        let writes_account = serializer.make_io_account(100, 16);

        let shared = Arc::new(CacheShared {
            state: Mutex::new(CacheState {
                current_pages: HashMap::new(),
                txns: HashMap::new(),
                acqs: HashMap::new(),
                pages: PageSlab::default(),
                evicter: Evicter::new(options.memory_limit),
                free_list,
                recencies,
                conns: HashMap::new(),
                waiting_for_spawn_flush: Vec::new(),
                read_ahead_active: options.start_read_ahead,
                next_txn_id: 0,
                next_acq_id: 0,
                next_conn_id: 0,
                access_clock: 0,
            }),
            throttler,
            serializer,
            drain: DrainSignal::default(),
            drainer: Drainer::default(),
            stats: CacheStats::default(),
            max_block_size,
            default_reads_account,
            writes_account,
            index_write_gate: IndexWriteGate::default(),
            index_write_mutex: Mutex::new(()),
        });

        if options.start_read_ahead {
            let weak = Arc::downgrade(&shared);
            shared
                .serializer
                .register_read_ahead(ReadAheadSink::new(move |block_id, bytes, token| {
                    if let Some(shared) = weak.upgrade() {
                        add_read_ahead_buf(&shared, block_id, bytes, token);
                    }
                }));
        }
        info!(max_block_size, "cache.open");
        PageCache { shared }
    }

    pub fn max_block_size(&self) -> usize {
        self.shared.max_block_size
    }

    /// Maps a priority (reference value 100) to an I/O account.
    pub fn create_cache_account(&self, priority: i32) -> IoAccount {
        let io_priority = 1.max(
            self.shared.default_reads_account.priority * priority / 100,
        );
        let outstanding_limit = 1.max(16 * priority as i64 / 100) as usize;
        self.shared
            .serializer
            .make_io_account(io_priority, outstanding_limit)
    }

    pub fn default_reads_account(&self) -> IoAccount {
        self.shared.default_reads_account.clone()
    }

    /// Opens a causal-ordering channel: transactions issued through one
    /// connection flush in commit order.
    pub fn new_conn(&self) -> CacheConn {
        let mut state = self.shared.state.lock();
        let conn_id = ConnId(state.next_conn_id);
        state.next_conn_id += 1;
        state.conns.insert(conn_id, None);
        CacheConn {
            shared: Arc::clone(&self.shared),
            conn_id,
        }
    }

    /// A transaction-less read acquirer.
    pub fn acquire_read(&self, block_id: BlockId) -> CurrentPageAcq {
        CurrentPageAcq::init(&self.shared, None, Access::Read, CreateMode::No(block_id))
    }

    /// Re-budgets the throttler and the evicter.
    pub fn inform_memory_limit_change(&self, memory_limit: u64) {
        self.shared
            .throttler
            .inform_memory_limit_change(memory_limit, self.shared.max_block_size as u64);
        let mut state = self.shared.state.lock();
        state.evicter.set_memory_limit(memory_limit);
        state.evict_if_needed(&self.shared.stats);
    }

    /// Tears down read-ahead and sweeps now-evictable current pages in the
    /// background. Idempotent.
    pub fn stop_read_ahead(&self) {
        stop_read_ahead(&self.shared);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        stop_read_ahead(&self.shared);
        self.shared.drain.signal();
        // Whatever still waits for a flush goes out as one final set:
        // every committed transaction has began_waiting_for_flush, so the
        // whole list is a valid flush set.
        {
            let mut state = self.shared.state.lock();
            let waiting = std::mem::take(&mut state.waiting_for_spawn_flush);
            spawn_flush_flushables(&self.shared, &mut state, waiting);
        }
        self.shared.drainer.wait_idle();
        info!("cache.closed");
    }
}

fn stop_read_ahead(shared: &Arc<CacheShared>) {
    {
        let mut state = shared.state.lock();
        if !state.read_ahead_active {
            return;
        }
        state.read_ahead_active = false;
    }
    shared.serializer.unregister_read_ahead();
    debug!("cache.read_ahead.teardown");

    // With read-ahead out of the way, current pages created only to hold
    // offered bytes can be reconsidered for eviction.
    shared.drainer.enter();
    let sweeper = Arc::clone(shared);
    thread::spawn(move || {
        sweep_evict_current_pages(&sweeper);
        sweeper.drainer.exit();
    });
}

fn sweep_evict_current_pages(shared: &Arc<CacheShared>) {
    let block_ids: Vec<BlockId> = {
        let state = shared.state.lock();
        state.current_pages.keys().copied().collect()
    };
    for (i, block_id) in block_ids.iter().enumerate() {
        if shared.drain.is_draining() {
            return;
        }
        {
            let mut state = shared.state.lock();
            state.consider_evicting_current_page(*block_id);
        }
        // Yield between chunks so the sweep cannot starve peers.
        if i % 16 == 15 {
            thread::yield_now();
        }
    }
}

fn add_read_ahead_buf(
    shared: &Arc<CacheShared>,
    block_id: BlockId,
    bytes: Box<[u8]>,
    token: BlockToken,
) {
    let mut state = shared.state.lock();
    // Once torn down, current pages may be dying: drop the offer.
    if !state.read_ahead_active {
        CacheStats::bump(&shared.stats.read_ahead_dropped);
        return;
    }
    // An existing current page means the authoritative copy may be newer.
    if state.current_pages.contains_key(&block_id) {
        CacheStats::bump(&shared.stats.read_ahead_dropped);
        return;
    }
    let idx = state.pages.insert(Page::from_read_ahead(block_id, bytes, token));
    state.touch_page_access(idx);
    state
        .current_pages
        .insert(block_id, CurrentPage::new(block_id, Some(idx)));
    state.evict_if_needed(&shared.stats);
    CacheStats::bump(&shared.stats.read_ahead_accepted);
}

/// How an acquirer comes by its block.
pub(crate) enum CreateMode {
    /// Acquire an existing block.
    No(BlockId),
    /// Create a block under a caller-chosen id.
    Chosen(BlockId),
    /// Create a block under a freshly vended id.
    New(BlockType),
}

/// Handle whose lifetime bounds a chain of causally-ordered transactions.
pub struct CacheConn {
    shared: Arc<CacheShared>,
    conn_id: ConnId,
}

impl CacheConn {
    /// Begins a read-only transaction. Reads skip the throttler entirely,
    /// so they may overtake writers.
    pub fn begin_read_txn(&self) -> Txn {
        CacheStats::bump(&self.shared.stats.txns_begun);
        let mut state = self.shared.state.lock();
        // Connections only order write flushes; read txns stay off the
        // chain.
        let txn_id = state.create_txn(ThrottlerAcq::none(), None, true);
        Txn {
            shared: Arc::clone(&self.shared),
            txn_id,
            read_only: true,
            durability: Durability::Soft,
            committed: false,
        }
    }

    /// Begins a write transaction, suspending on the throttler until its
    /// expected change count fits.
    pub fn begin_write_txn(&self, durability: Durability, expected_change_count: i64) -> Txn {
        assert!(expected_change_count >= 0);
        CacheStats::bump(&self.shared.stats.txns_begun);
        let throttler_acq = self.shared.throttler.begin_or_throttle(expected_change_count);
        let mut state = self.shared.state.lock();
        let txn_id = state.create_txn(throttler_acq, Some(self.conn_id), false);
        Txn {
            shared: Arc::clone(&self.shared),
            txn_id,
            read_only: false,
            durability,
            committed: false,
        }
    }
}

impl Drop for CacheConn {
    fn drop(&mut self) {
        // Soft durability lets a txn outlive its connection; tell it we no
        // longer exist.
        let mut state = self.shared.state.lock();
        if let Some(Some(newest)) = state.conns.remove(&self.conn_id) {
            if let Some(txn) = state.txns.get_mut(&newest) {
                debug_assert_eq!(txn.conn, Some(self.conn_id));
                txn.conn = None;
            }
        }
    }
}

/// A transaction. Write transactions must be committed; dropping an
/// uncommitted one is a data-corruption risk and terminates the process.
pub struct Txn {
    shared: Arc<CacheShared>,
    txn_id: TxnId,
    read_only: bool,
    durability: Durability,
    committed: bool,
}

impl Txn {
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Acquires a block. Write access queues behind every earlier
    /// acquirer; read access is granted as soon as no writer precedes.
    pub fn acquire(&self, block_id: BlockId, access: Access) -> CurrentPageAcq {
        match access {
            Access::Read => {
                CurrentPageAcq::init(&self.shared, None, Access::Read, CreateMode::No(block_id))
            }
            Access::Write => {
                assert!(!self.read_only, "write acquisition on a read txn");
                CurrentPageAcq::init(
                    &self.shared,
                    Some(self.txn_id),
                    Access::Write,
                    CreateMode::No(block_id),
                )
            }
        }
    }

    /// Creates a block under a caller-chosen id, which must be unused.
    pub fn acquire_for_create(&self, block_id: BlockId) -> CurrentPageAcq {
        assert!(!self.read_only, "block creation on a read txn");
        CurrentPageAcq::init(
            &self.shared,
            Some(self.txn_id),
            Access::Write,
            CreateMode::Chosen(block_id),
        )
    }

    /// Creates a block under a freshly vended id.
    pub fn create(&self, block_type: BlockType) -> CurrentPageAcq {
        assert!(!self.read_only, "block creation on a read txn");
        CurrentPageAcq::init(
            &self.shared,
            Some(self.txn_id),
            Access::Write,
            CreateMode::New(block_type),
        )
    }

    /// Commits. For writes this hands the transaction to the flush engine,
    /// waiting for completion under hard durability; for reads it is a
    /// no-op reap.
    pub fn commit(mut self) {
        if self.read_only {
            self.committed = true;
            return; // drop reaps
        }
        self.committed = true;
        CacheStats::bump(&self.shared.stats.txns_committed);
        let latch = begin_waiting_for_flush(&self.shared, self.txn_id, self.durability);
        if self.durability.is_hard() {
            latch.wait();
        }
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if self.read_only {
            let mut state = self.shared.state.lock();
            state.end_read_txn(self.txn_id);
        } else if !self.committed {
            error!(
                "a write transaction was aborted; terminating to avoid data corruption"
            );
            if !thread::panicking() {
                std::process::abort();
            }
        }
    }
}
