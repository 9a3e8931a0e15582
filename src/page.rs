use std::sync::Arc;

use parking_lot::RwLock;

use crate::serializer::{BlockToken, PageBuf};
use crate::signal::OneShot;
use crate::types::BlockId;

/// Index of a page in the cache's slab. Never aliased: a slot is reused
/// only after its page's last holder drops it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub(crate) struct PageIdx(pub usize);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum LoadState {
    /// Bytes are being read from the serializer; `waiters` holds latches
    /// pulsed when the load settles.
    Loading,
    /// Bytes are resident.
    Loaded,
    /// Only the on-disk image exists. The token may still be unknown here,
    /// in which case the serializer's index is consulted at load time.
    DiskBacked,
}

/// One cached block image: resident bytes, an on-disk token, or both.
pub(crate) struct Page {
    pub block_id: BlockId,
    pub buf: Option<PageBuf>,
    pub token: Option<BlockToken>,
    pub state: LoadState,
    pub waiters: Vec<Arc<OneShot>>,
    /// Holders: the owning `current_page` plus every snapshot reference.
    pub ptr_count: u32,
    pub last_access: u64,
}

impl Page {
    /// A freshly created block: resident zeroed bytes, nothing on disk.
    pub fn new_resident(block_id: BlockId, block_size: usize) -> Self {
        Self {
            block_id,
            buf: Some(Arc::new(RwLock::new(
                vec![0u8; block_size].into_boxed_slice(),
            ))),
            token: None,
            state: LoadState::Loaded,
            waiters: Vec::new(),
            ptr_count: 1,
            last_access: 0,
        }
    }

    /// A block known only by its on-disk image.
    pub fn new_disk_backed(block_id: BlockId, token: Option<BlockToken>) -> Self {
        Self {
            block_id,
            buf: None,
            token,
            state: LoadState::DiskBacked,
            waiters: Vec::new(),
            ptr_count: 1,
            last_access: 0,
        }
    }

    /// A block delivered by read-ahead: bytes and token both present.
    pub fn from_read_ahead(block_id: BlockId, bytes: Box<[u8]>, token: BlockToken) -> Self {
        Self {
            block_id,
            buf: Some(Arc::new(RwLock::new(bytes))),
            token: Some(token),
            state: LoadState::Loaded,
            waiters: Vec::new(),
            ptr_count: 1,
            last_access: 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state == LoadState::Loaded
    }

    pub fn is_loading(&self) -> bool {
        self.state == LoadState::Loading
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.buf.as_ref().map_or(0, |buf| buf.read().len() as u64)
    }
}

/// Slab of pages with explicit free-slot reuse.
#[derive(Default)]
pub(crate) struct PageSlab {
    slots: Vec<Option<Page>>,
    free: Vec<usize>,
}

impl PageSlab {
    pub fn insert(&mut self, page: Page) -> PageIdx {
        if let Some(slot) = self.free.pop() {
            debug_assert!(self.slots[slot].is_none());
            self.slots[slot] = Some(page);
            PageIdx(slot)
        } else {
            self.slots.push(Some(page));
            PageIdx(self.slots.len() - 1)
        }
    }

    pub fn get(&self, idx: PageIdx) -> &Page {
        self.slots[idx.0].as_ref().expect("live page slot")
    }

    pub fn get_mut(&mut self, idx: PageIdx) -> &mut Page {
        self.slots[idx.0].as_mut().expect("live page slot")
    }

    pub fn remove(&mut self, idx: PageIdx) -> Page {
        let page = self.slots[idx.0].take().expect("live page slot");
        self.free.push(idx.0);
        page
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
