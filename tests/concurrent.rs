use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use marea::{
    Access, BlockId, BlockType, CacheOptions, Durability, FileSerializer, PageCache, Recency,
    Result, Serializer,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

const BLOCK_SIZE: usize = 4096;
const NUM_WRITERS: usize = 4;
const INCREMENTS_PER_WRITER: usize = 25;

fn open_cache(dir: &std::path::Path) -> Result<(Arc<FileSerializer>, Arc<PageCache>)> {
    let serializer = Arc::new(FileSerializer::open(dir, BLOCK_SIZE)?);
    let cache = Arc::new(PageCache::new(
        Arc::clone(&serializer) as Arc<dyn Serializer>,
        CacheOptions {
            start_read_ahead: false,
            ..CacheOptions::default()
        },
    ));
    Ok((serializer, cache))
}

#[test]
fn concurrent_increments_serialize_through_the_acquirer_queue() -> Result<()> {
    let dir = tempdir().unwrap();
    let (_serializer, cache) = open_cache(dir.path())?;

    let block = {
        let conn = cache.new_conn();
        let txn = conn.begin_write_txn(Durability::Hard, 1);
        let acq = txn.create(BlockType::Normal);
        let block = acq.block_id();
        drop(acq);
        txn.commit();
        block
    };

    let barrier = Arc::new(Barrier::new(NUM_WRITERS));
    let mut handles = Vec::new();
    for _ in 0..NUM_WRITERS {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            let conn = cache.new_conn();
            let account = cache.default_reads_account();
            barrier.wait();
            for _ in 0..INCREMENTS_PER_WRITER {
                let txn = conn.begin_write_txn(Durability::Soft, 1);
                let acq = txn.acquire(block, Access::Write);
                {
                    let mut page = acq.page_for_write(&account)?;
                    let counter = u64::from_le_bytes(page[..8].try_into().expect("8 bytes"));
                    page[..8].copy_from_slice(&(counter + 1).to_le_bytes());
                }
                drop(acq);
                txn.commit();
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().unwrap()?;
    }

    // The resident page already reflects every committed increment; a
    // final hard commit settles the graph before reading.
    let conn = cache.new_conn();
    let sync = conn.begin_write_txn(Durability::Hard, 0);
    sync.commit();

    let account = cache.default_reads_account();
    let acq = cache.acquire_read(block);
    let page = acq.page_for_read(&account)?;
    let counter = u64::from_le_bytes(page[..8].try_into().expect("8 bytes"));
    assert_eq!(counter as usize, NUM_WRITERS * INCREMENTS_PER_WRITER);
    Ok(())
}

#[test]
fn readers_never_observe_torn_fills() -> Result<()> {
    let dir = tempdir().unwrap();
    let (_serializer, cache) = open_cache(dir.path())?;

    let block = {
        let conn = cache.new_conn();
        let account = cache.default_reads_account();
        let txn = conn.begin_write_txn(Durability::Hard, 1);
        let acq = txn.create(BlockType::Normal);
        let block = acq.block_id();
        acq.page_for_write(&account)?.fill(1);
        drop(acq);
        txn.commit();
        block
    };

    let mut handles = Vec::new();
    for writer_id in 0..3u8 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || -> Result<()> {
            let conn = cache.new_conn();
            let account = cache.default_reads_account();
            for round in 0..10 {
                let txn = conn.begin_write_txn(Durability::Soft, 1);
                let acq = txn.acquire(block, Access::Write);
                let fill = writer_id
                    .wrapping_mul(10)
                    .wrapping_add(round)
                    .wrapping_add(1);
                acq.page_for_write(&account)?.fill(fill);
                drop(acq);
                txn.commit();
            }
            Ok(())
        }));
    }
    for _ in 0..3 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || -> Result<()> {
            let account = cache.default_reads_account();
            for _ in 0..20 {
                let acq = cache.acquire_read(block);
                let page = acq.page_for_read(&account)?;
                let first = page[0];
                assert!(
                    page.iter().all(|&b| b == first),
                    "block fill must be uniform under the writer-exclusion protocol"
                );
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().unwrap()?;
    }
    Ok(())
}

#[test]
fn randomized_mixed_operations_stay_consistent() -> Result<()> {
    let dir = tempdir().unwrap();
    let (_serializer, cache) = open_cache(dir.path())?;

    let blocks: Arc<Vec<BlockId>> = {
        let conn = cache.new_conn();
        let account = cache.default_reads_account();
        let mut blocks = Vec::new();
        for _ in 0..8 {
            let txn = conn.begin_write_txn(Durability::Soft, 1);
            let acq = txn.create(BlockType::Normal);
            blocks.push(acq.block_id());
            acq.page_for_write(&account)?.fill(1);
            drop(acq);
            txn.commit();
        }
        Arc::new(blocks)
    };

    // Recencies must stay monotone per block, so all threads draw from
    // one clock.
    let recency_clock = Arc::new(AtomicU64::new(1));

    let mut handles = Vec::new();
    for seed in 0..4u64 {
        let cache = Arc::clone(&cache);
        let blocks = Arc::clone(&blocks);
        let recency_clock = Arc::clone(&recency_clock);
        handles.push(thread::spawn(move || -> Result<()> {
            let mut rng = StdRng::seed_from_u64(seed);
            let conn = cache.new_conn();
            let account = cache.default_reads_account();
            for _ in 0..30 {
                let block = blocks[rng.gen_range(0..blocks.len())];
                match rng.gen_range(0..4u32) {
                    0 => {
                        let acq = cache.acquire_read(block);
                        let page = acq.page_for_read(&account)?;
                        let first = page[0];
                        assert!(page.iter().all(|&b| b == first));
                    }
                    1 => {
                        let txn = conn.begin_read_txn();
                        let mut acq = txn.acquire(block, Access::Read);
                        acq.declare_snapshotted();
                        let page = acq.page_for_read(&account)?;
                        let first = page[0];
                        assert!(page.iter().all(|&b| b == first));
                        drop(page);
                        drop(acq);
                        txn.commit();
                    }
                    2 => {
                        let txn = conn.begin_write_txn(Durability::Soft, 1);
                        let acq = txn.acquire(block, Access::Write);
                        let fill = rng.gen_range(1..=u8::MAX);
                        acq.page_for_write(&account)?.fill(fill);
                        drop(acq);
                        txn.commit();
                    }
                    _ => {
                        let txn = conn.begin_write_txn(Durability::Soft, 1);
                        let acq = txn.acquire(block, Access::Write);
                        // Draw the stamp only once writable, so per-block
                        // recencies advance in acquisition order.
                        acq.write_ready().wait();
                        let stamp = recency_clock.fetch_add(1, Ordering::Relaxed);
                        acq.set_recency(Recency(stamp));
                        drop(acq);
                        txn.commit();
                    }
                }
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().unwrap()?;
    }

    let conn = cache.new_conn();
    let sync = conn.begin_write_txn(Durability::Hard, 0);
    sync.commit();

    let account = cache.default_reads_account();
    for block in blocks.iter() {
        let acq = cache.acquire_read(*block);
        let page = acq.page_for_read(&account)?;
        let first = page[0];
        assert!(first != 0, "blocks never revert to their zeroed state");
        assert!(page.iter().all(|&b| b == first));
    }
    Ok(())
}

#[test]
fn counter_survives_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    let block;
    {
        let (_serializer, cache) = open_cache(dir.path())?;
        let conn = cache.new_conn();
        let account = cache.default_reads_account();
        let txn = conn.begin_write_txn(Durability::Hard, 1);
        let acq = txn.create(BlockType::Normal);
        block = acq.block_id();
        {
            let mut page = acq.page_for_write(&account)?;
            page[..8].copy_from_slice(&123_456u64.to_le_bytes());
        }
        drop(acq);
        txn.commit();
    }

    let (_serializer, cache) = open_cache(dir.path())?;
    let account = cache.default_reads_account();
    let acq = cache.acquire_read(block);
    let page = acq.page_for_read(&account)?;
    assert_eq!(
        u64::from_le_bytes(page[..8].try_into().expect("8 bytes")),
        123_456
    );
    Ok(())
}
