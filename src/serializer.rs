//! Contract between the cache and the block serializer.
//!
//! The cache never interprets on-disk layout; it addresses storage through
//! this trait and treats [`BlockToken`]s as opaque. The file-backed
//! implementation lives in [`crate::file_serializer`].

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::types::{BlockId, Recency};

/// Shared handle to one cached block's bytes.
pub type PageBuf = Arc<RwLock<Box<[u8]>>>;

/// Opaque reference to a block image in serializer storage. A token stays
/// valid as long as the index still points at the same image.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct BlockToken {
    pub offset: u64,
    pub len: u32,
}

/// I/O accounting handle vended by the serializer. Priorities are relative
/// to the reference value 100.
#[derive(Clone, Debug)]
pub struct IoAccount {
    pub priority: i32,
    pub outstanding_limit: usize,
}

/// One block image queued for a batched write.
pub struct BufWrite {
    pub block_id: BlockId,
    pub buf: PageBuf,
}

/// One entry of a serializer index update.
#[derive(Clone, Debug)]
pub struct IndexWriteOp {
    pub block_id: BlockId,
    /// `Some(Some(token))` repoints the block, `Some(None)` writes a
    /// tombstone, `None` leaves the token untouched.
    pub token: Option<Option<BlockToken>>,
    pub recency: Option<Recency>,
}

impl IndexWriteOp {
    pub fn write(block_id: BlockId, token: BlockToken, recency: Recency) -> Self {
        Self {
            block_id,
            token: Some(Some(token)),
            recency: Some(recency),
        }
    }

    pub fn touch(block_id: BlockId, recency: Recency) -> Self {
        Self {
            block_id,
            token: None,
            recency: Some(recency),
        }
    }

    pub fn tombstone(block_id: BlockId) -> Self {
        Self {
            block_id,
            token: Some(None),
            recency: Some(Recency::INVALID),
        }
    }
}

/// Receives read-ahead offers on the serializer's schedule. Offers arrive
/// in the order the serializer issues them.
pub struct ReadAheadSink {
    offer: Box<dyn Fn(BlockId, Box<[u8]>, BlockToken) + Send + Sync>,
}

impl ReadAheadSink {
    pub fn new(offer: impl Fn(BlockId, Box<[u8]>, BlockToken) + Send + Sync + 'static) -> Self {
        Self {
            offer: Box::new(offer),
        }
    }

    pub fn offer(&self, block_id: BlockId, buf: Box<[u8]>, token: BlockToken) {
        (self.offer)(block_id, buf, token);
    }
}

/// Block storage the cache sits on top of.
///
/// Implementations are internally synchronized; the cache calls in from
/// user threads and from flush workers. I/O failures are surfaced as
/// errors and treated as fatal by the cache.
pub trait Serializer: Send + Sync + 'static {
    /// Size of every block image, in bytes.
    fn max_block_size(&self) -> usize;

    /// One past the highest normal block id the index knows about.
    fn end_block_id(&self) -> u64;

    /// One past the highest aux index the index knows about.
    fn end_aux_block_index(&self) -> u64;

    /// Recency of every normal block id below [`Self::end_block_id`];
    /// deleted and never-written ids report [`Recency::INVALID`].
    fn get_all_recencies(&self) -> Vec<Recency>;

    fn make_io_account(&self, priority: i32, outstanding_limit: usize) -> IoAccount;

    /// Writes every image durably and returns one token per write, in
    /// order. Tokens do not take effect until a subsequent `index_write`.
    fn block_writes(&self, writes: &[BufWrite], account: &IoAccount) -> Result<Vec<BlockToken>>;

    /// Reads the image a token points at into `buf`; returns the byte
    /// count.
    fn block_read(&self, token: BlockToken, buf: &mut [u8], account: &IoAccount) -> Result<usize>;

    /// Current token for a block, if the index holds one.
    fn token_for_block(&self, block_id: BlockId) -> Result<Option<BlockToken>>;

    /// Applies `ops` to the index. `on_in_memory_update` runs after the
    /// in-memory index reflects the ops and before they reach disk; the
    /// call returns only once the update is durable.
    fn index_write(&self, ops: &[IndexWriteOp], on_in_memory_update: &mut dyn FnMut())
        -> Result<()>;

    /// Starts offering resident-on-disk blocks to `sink`.
    fn register_read_ahead(&self, sink: ReadAheadSink);

    /// Stops read-ahead offers. Idempotent; offers already in flight may
    /// still arrive and are dropped by the sink's owner.
    fn unregister_read_ahead(&self);
}
