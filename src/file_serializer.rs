//! File-backed [`Serializer`].
//!
//! Block images live in a data file at block-size-aligned offsets; the
//! index (block id → token + recency) is kept in memory and rewritten to a
//! sibling file through a temp-file rename on every index write. This is a
//! deliberately small serializer: it provides the durability contract the
//! cache needs without log-structured reclamation.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{MareaError, Result};
use crate::serializer::{
    BlockToken, BufWrite, IndexWriteOp, IoAccount, ReadAheadSink, Serializer,
};
use crate::types::{BlockId, Recency};

const INDEX_MAGIC: [u8; 4] = *b"MRIX";
const INDEX_FORMAT_VERSION: u16 = 1;
const INDEX_HEADER_LEN: usize = 18;
const INDEX_ENTRY_LEN: usize = 29;

const DATA_FILE: &str = "blocks.marea";
const INDEX_FILE: &str = "index.marea";

#[derive(Clone, Copy)]
struct IndexEntry {
    token: Option<BlockToken>,
    recency: Recency,
}

struct SerState {
    index: HashMap<BlockId, IndexEntry>,
    next_offset: u64,
}

pub struct FileSerializer {
    dir: PathBuf,
    block_size: usize,
    data: File,
    state: Mutex<SerState>,
    read_ahead_stop: Mutex<Option<Arc<AtomicBool>>>,
}

impl FileSerializer {
    /// Opens (or creates) serializer storage under `dir`.
    pub fn open(dir: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        assert!(block_size > 0);
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(DATA_FILE))?;
        let index = load_index(&dir.join(INDEX_FILE), block_size)?;
        let data_len = data.metadata()?.len();
        let next_offset = data_len.div_ceil(block_size as u64) * block_size as u64;
        debug!(
            dir = %dir.display(),
            blocks = index.len(),
            next_offset,
            "file_serializer.open"
        );
        Ok(Self {
            dir,
            block_size,
            data,
            state: Mutex::new(SerState { index, next_offset }),
            read_ahead_stop: Mutex::new(None),
        })
    }

    fn persist_index(&self, state: &SerState) -> Result<()> {
        let mut buf =
            Vec::with_capacity(INDEX_HEADER_LEN + state.index.len() * INDEX_ENTRY_LEN);
        buf.extend_from_slice(&INDEX_MAGIC);
        buf.extend_from_slice(&INDEX_FORMAT_VERSION.to_be_bytes());
        buf.extend_from_slice(&(self.block_size as u32).to_be_bytes());
        buf.extend_from_slice(&(state.index.len() as u64).to_be_bytes());
        for (&block_id, entry) in &state.index {
            buf.extend_from_slice(&block_id.0.to_be_bytes());
            match entry.token {
                Some(token) => {
                    buf.push(1);
                    buf.extend_from_slice(&token.offset.to_be_bytes());
                    buf.extend_from_slice(&token.len.to_be_bytes());
                }
                None => {
                    buf.push(0);
                    buf.extend_from_slice(&0u64.to_be_bytes());
                    buf.extend_from_slice(&0u32.to_be_bytes());
                }
            }
            buf.extend_from_slice(&entry.recency.0.to_be_bytes());
        }

        let final_path = self.dir.join(INDEX_FILE);
        let tmp_path = self.dir.join("index.tmp");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            io::Write::write_all(&mut tmp, &buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

impl Serializer for FileSerializer {
    fn max_block_size(&self) -> usize {
        self.block_size
    }

    fn end_block_id(&self) -> u64 {
        let state = self.state.lock();
        state
            .index
            .keys()
            .filter(|id| !id.is_aux())
            .map(|id| id.0 + 1)
            .max()
            .unwrap_or(0)
    }

    fn end_aux_block_index(&self) -> u64 {
        let state = self.state.lock();
        state
            .index
            .keys()
            .filter(|id| id.is_aux())
            .map(|id| id.aux_index() + 1)
            .max()
            .unwrap_or(0)
    }

    fn get_all_recencies(&self) -> Vec<Recency> {
        let state = self.state.lock();
        let end = state
            .index
            .keys()
            .filter(|id| !id.is_aux())
            .map(|id| id.0 + 1)
            .max()
            .unwrap_or(0);
        let mut recencies = vec![Recency::INVALID; end as usize];
        for (id, entry) in &state.index {
            if !id.is_aux() {
                recencies[id.0 as usize] = entry.recency;
            }
        }
        recencies
    }

    fn make_io_account(&self, priority: i32, outstanding_limit: usize) -> IoAccount {
        IoAccount {
            priority: priority.max(1),
            outstanding_limit: outstanding_limit.max(1),
        }
    }

    fn block_writes(&self, writes: &[BufWrite], _account: &IoAccount) -> Result<Vec<BlockToken>> {
        let mut state = self.state.lock();
        let mut tokens = Vec::with_capacity(writes.len());
        for write in writes {
            let image = write.buf.read();
            assert_eq!(
                image.len(),
                self.block_size,
                "block image must be exactly one block"
            );
            let offset = state.next_offset;
            fs_io::write_all_at(&self.data, offset, &image)?;
            state.next_offset += self.block_size as u64;
            tokens.push(BlockToken {
                offset,
                len: image.len() as u32,
            });
        }
        if !writes.is_empty() {
            self.data.sync_all()?;
        }
        debug!(blocks = writes.len(), "file_serializer.block_writes");
        Ok(tokens)
    }

    fn block_read(&self, token: BlockToken, buf: &mut [u8], _account: &IoAccount) -> Result<usize> {
        let len = token.len as usize;
        if len > buf.len() {
            return Err(MareaError::Invalid("read buffer smaller than block"));
        }
        fs_io::read_exact_at(&self.data, token.offset, &mut buf[..len])?;
        Ok(len)
    }

    fn token_for_block(&self, block_id: BlockId) -> Result<Option<BlockToken>> {
        let state = self.state.lock();
        Ok(state.index.get(&block_id).and_then(|entry| entry.token))
    }

    fn index_write(
        &self,
        ops: &[IndexWriteOp],
        on_in_memory_update: &mut dyn FnMut(),
    ) -> Result<()> {
        let mut state = self.state.lock();
        for op in ops {
            match op.token {
                Some(None) => {
                    state.index.remove(&op.block_id);
                }
                Some(Some(token)) => {
                    let entry = state.index.entry(op.block_id).or_insert(IndexEntry {
                        token: None,
                        recency: Recency::INVALID,
                    });
                    entry.token = Some(token);
                    if let Some(recency) = op.recency {
                        entry.recency = recency;
                    }
                }
                None => {
                    let entry = state.index.entry(op.block_id).or_insert(IndexEntry {
                        token: None,
                        recency: Recency::INVALID,
                    });
                    if let Some(recency) = op.recency {
                        entry.recency = recency;
                    }
                }
            }
        }
        on_in_memory_update();
        self.persist_index(&state)?;
        debug!(ops = ops.len(), "file_serializer.index_write");
        Ok(())
    }

    fn register_read_ahead(&self, sink: ReadAheadSink) {
        let stop = Arc::new(AtomicBool::new(false));
        {
            let mut slot = self.read_ahead_stop.lock();
            if slot.is_some() {
                warn!("file_serializer.read_ahead_already_registered");
                return;
            }
            *slot = Some(Arc::clone(&stop));
        }

        let mut entries: Vec<(BlockId, BlockToken)> = {
            let state = self.state.lock();
            state
                .index
                .iter()
                .filter_map(|(id, entry)| entry.token.map(|token| (*id, token)))
                .collect()
        };
        entries.sort_by_key(|(id, _)| *id);

        let data = match self.data.try_clone() {
            Ok(file) => file,
            Err(err) => {
                warn!(error = %err, "file_serializer.read_ahead_clone_failed");
                return;
            }
        };
        let block_size = self.block_size;
        thread::spawn(move || {
            for (block_id, token) in entries {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let mut buf = vec![0u8; block_size].into_boxed_slice();
                let len = token.len as usize;
                if fs_io::read_exact_at(&data, token.offset, &mut buf[..len]).is_err() {
                    warn!(%block_id, "file_serializer.read_ahead_read_failed");
                    continue;
                }
                sink.offer(block_id, buf, token);
            }
            debug!("file_serializer.read_ahead_done");
        });
    }

    fn unregister_read_ahead(&self) {
        if let Some(stop) = self.read_ahead_stop.lock().take() {
            stop.store(true, Ordering::Release);
        }
    }
}

impl Drop for FileSerializer {
    fn drop(&mut self) {
        self.unregister_read_ahead();
    }
}

fn load_index(path: &Path, block_size: usize) -> Result<HashMap<BlockId, IndexEntry>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(MareaError::from(err)),
    };
    if bytes.len() < INDEX_HEADER_LEN {
        return Err(MareaError::Corruption("index file truncated"));
    }
    if bytes[0..4] != INDEX_MAGIC {
        return Err(MareaError::Corruption("bad index magic"));
    }
    let version = u16::from_be_bytes(bytes[4..6].try_into().expect("sized slice"));
    if version != INDEX_FORMAT_VERSION {
        return Err(MareaError::Corruption("unsupported index format version"));
    }
    let stored_block_size = u32::from_be_bytes(bytes[6..10].try_into().expect("sized slice"));
    if stored_block_size as usize != block_size {
        return Err(MareaError::Invalid("index block size mismatch"));
    }
    let count = u64::from_be_bytes(bytes[10..18].try_into().expect("sized slice")) as usize;
    if bytes.len() < INDEX_HEADER_LEN + count * INDEX_ENTRY_LEN {
        return Err(MareaError::Corruption("index file truncated"));
    }

    let mut index = HashMap::with_capacity(count);
    let mut at = INDEX_HEADER_LEN;
    for _ in 0..count {
        let entry = &bytes[at..at + INDEX_ENTRY_LEN];
        at += INDEX_ENTRY_LEN;
        let block_id = BlockId(u64::from_be_bytes(entry[0..8].try_into().expect("sized")));
        let has_token = entry[8] == 1;
        let offset = u64::from_be_bytes(entry[9..17].try_into().expect("sized"));
        let len = u32::from_be_bytes(entry[17..21].try_into().expect("sized"));
        let recency = Recency(u64::from_be_bytes(entry[21..29].try_into().expect("sized")));
        index.insert(
            block_id,
            IndexEntry {
                token: has_token.then_some(BlockToken { offset, len }),
                recency,
            },
        );
    }
    Ok(index)
}

mod fs_io {
    use std::fs::File;
    use std::io;

    #[cfg(unix)]
    pub fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    #[cfg(unix)]
    pub fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}
