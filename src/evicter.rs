//! Eviction bookkeeping.
//!
//! Every page sits in exactly one bag, derived from its load state, token
//! presence, and holder count. When resident bytes exceed the budget,
//! victims come from the disk-backed evictable bag in least-recently-used
//! order; dropping their bytes leaves the on-disk image authoritative.

use std::collections::{BTreeSet, HashMap};

use crate::page::{LoadState, Page, PageIdx};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum EvictionBag {
    /// Loading, or held by snapshots, or awaited.
    Unevictable,
    /// Resident with a valid token: bytes can be dropped.
    EvictableDiskBacked,
    /// Resident without a token: the only copy, must be flushed first.
    EvictableUnbacked,
    /// Bytes already gone.
    Evicted,
}

struct PageRecord {
    bag: EvictionBag,
    bytes: u64,
    last_access: u64,
}

pub(crate) struct Evicter {
    memory_limit: u64,
    in_memory_bytes: u64,
    records: HashMap<PageIdx, PageRecord>,
    disk_backed_lru: BTreeSet<(u64, PageIdx)>,
}

impl Evicter {
    pub fn new(memory_limit: u64) -> Self {
        Self {
            memory_limit,
            in_memory_bytes: 0,
            records: HashMap::new(),
            disk_backed_lru: BTreeSet::new(),
        }
    }

    pub fn set_memory_limit(&mut self, memory_limit: u64) {
        self.memory_limit = memory_limit;
    }

    pub fn in_memory_bytes(&self) -> u64 {
        self.in_memory_bytes
    }

    fn correct_bag(page: &Page) -> EvictionBag {
        match page.state {
            LoadState::Loading => EvictionBag::Unevictable,
            LoadState::Loaded => {
                if page.ptr_count > 1 || page.has_waiters() {
                    EvictionBag::Unevictable
                } else if page.token.is_some() {
                    EvictionBag::EvictableDiskBacked
                } else {
                    EvictionBag::EvictableUnbacked
                }
            }
            LoadState::DiskBacked => EvictionBag::Evicted,
        }
    }

    /// Re-derives a page's bag after any state change.
    pub fn refresh(&mut self, idx: PageIdx, page: &Page) {
        let bag = Self::correct_bag(page);
        let bytes = page.resident_bytes();
        let last_access = page.last_access;

        if let Some(record) = self.records.get_mut(&idx) {
            self.in_memory_bytes -= record.bytes;
            if record.bag == EvictionBag::EvictableDiskBacked {
                self.disk_backed_lru.remove(&(record.last_access, idx));
            }
            record.bag = bag;
            record.bytes = bytes;
            record.last_access = last_access;
        } else {
            self.records.insert(
                idx,
                PageRecord {
                    bag,
                    bytes,
                    last_access,
                },
            );
        }
        self.in_memory_bytes += bytes;
        if bag == EvictionBag::EvictableDiskBacked {
            self.disk_backed_lru.insert((last_access, idx));
        }
    }

    pub fn forget(&mut self, idx: PageIdx) {
        if let Some(record) = self.records.remove(&idx) {
            self.in_memory_bytes -= record.bytes;
            if record.bag == EvictionBag::EvictableDiskBacked {
                self.disk_backed_lru.remove(&(record.last_access, idx));
            }
        }
    }

    pub fn over_budget(&self) -> bool {
        self.in_memory_bytes > self.memory_limit
    }

    /// Least recently used page whose bytes may be dropped.
    pub fn pick_victim(&self) -> Option<PageIdx> {
        self.disk_backed_lru.iter().next().map(|&(_, idx)| idx)
    }

    #[cfg(test)]
    pub fn bag_of(&self, idx: PageIdx) -> Option<EvictionBag> {
        self.records.get(&idx).map(|record| record.bag)
    }
}
