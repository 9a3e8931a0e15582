use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use marea::{
    Access, BlockId, BlockType, CacheOptions, Durability, FileSerializer, PageCache, Recency,
    Result, Serializer,
};
use tempfile::tempdir;

const BLOCK_SIZE: usize = 4096;

fn open_serializer(dir: &Path) -> Result<Arc<FileSerializer>> {
    Ok(Arc::new(FileSerializer::open(dir, BLOCK_SIZE)?))
}

fn open_cache(serializer: &Arc<FileSerializer>) -> PageCache {
    PageCache::new(
        Arc::clone(serializer) as Arc<dyn Serializer>,
        CacheOptions {
            start_read_ahead: false,
            ..CacheOptions::default()
        },
    )
}

/// Creates a block filled with `fill` and returns its id.
fn create_filled_block(cache: &PageCache, fill: u8, durability: Durability) -> Result<BlockId> {
    let conn = cache.new_conn();
    let account = cache.default_reads_account();
    let txn = conn.begin_write_txn(durability, 1);
    let acq = txn.create(BlockType::Normal);
    let block_id = acq.block_id();
    {
        let mut page = acq.page_for_write(&account)?;
        page.fill(fill);
    }
    drop(acq);
    txn.commit();
    Ok(block_id)
}

fn read_block(cache: &PageCache, block_id: BlockId) -> Result<Vec<u8>> {
    let account = cache.default_reads_account();
    let acq = cache.acquire_read(block_id);
    let page = acq.page_for_read(&account)?;
    Ok(page.to_vec())
}

#[test]
fn create_commit_read_back() -> Result<()> {
    let dir = tempdir().unwrap();
    let serializer = open_serializer(dir.path())?;
    let cache = open_cache(&serializer);

    let block_id = create_filled_block(&cache, 0x5A, Durability::Soft)?;
    let bytes = read_block(&cache, block_id)?;
    assert_eq!(bytes.len(), BLOCK_SIZE);
    assert!(bytes.iter().all(|&b| b == 0x5A));

    let stats = cache.stats();
    assert_eq!(stats.txns_committed, 1);
    Ok(())
}

#[test]
fn soft_then_hard_writes_reach_disk() -> Result<()> {
    let dir = tempdir().unwrap();
    let serializer = open_serializer(dir.path())?;
    let cache = open_cache(&serializer);
    let account = cache.default_reads_account();
    let conn = cache.new_conn();
    let block = BlockId(5);

    let txn_a = conn.begin_write_txn(Durability::Soft, 1);
    let acq = txn_a.acquire_for_create(block);
    acq.page_for_write(&account)?.fill(0x10);
    drop(acq);
    txn_a.commit();

    let txn_b = conn.begin_write_txn(Durability::Hard, 1);
    let acq = txn_b.acquire(block, Access::Write);
    acq.page_for_write(&account)?.fill(0x20);
    drop(acq);
    txn_b.commit();

    // A fresh transaction observes B's bytes.
    let bytes = read_block(&cache, block)?;
    assert!(bytes.iter().all(|&b| b == 0x20));

    // So does the disk, through the serializer directly.
    let token = serializer
        .token_for_block(block)?
        .expect("block 5 is indexed");
    let mut on_disk = vec![0u8; BLOCK_SIZE];
    serializer.block_read(token, &mut on_disk, &account)?;
    assert!(on_disk.iter().all(|&b| b == 0x20));
    Ok(())
}

#[test]
fn hard_commit_round_trips_through_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    let block_id;
    {
        let serializer = open_serializer(dir.path())?;
        let cache = open_cache(&serializer);
        let account = cache.default_reads_account();
        let conn = cache.new_conn();

        let txn = conn.begin_write_txn(Durability::Hard, 1);
        let acq = txn.create(BlockType::Normal);
        block_id = acq.block_id();
        acq.page_for_write(&account)?.fill(0xC3);
        acq.set_recency(Recency(77));
        drop(acq);
        txn.commit();
    }

    let serializer = open_serializer(dir.path())?;
    let cache = open_cache(&serializer);
    let bytes = read_block(&cache, block_id)?;
    assert!(bytes.iter().all(|&b| b == 0xC3));

    let acq = cache.acquire_read(block_id);
    assert_eq!(acq.recency(), Recency(77));
    Ok(())
}

#[test]
fn snapshot_reader_sees_pre_write_state() -> Result<()> {
    let dir = tempdir().unwrap();
    let serializer = open_serializer(dir.path())?;
    let cache = open_cache(&serializer);
    let account = cache.default_reads_account();
    let conn = cache.new_conn();

    let block = {
        let txn = conn.begin_write_txn(Durability::Hard, 1);
        let acq = txn.create(BlockType::Normal);
        let block = acq.block_id();
        acq.page_for_write(&account)?.fill(0xAA);
        acq.set_recency(Recency(100));
        drop(acq);
        txn.commit();
        block
    };

    let read_txn = conn.begin_read_txn();
    let mut snap = read_txn.acquire(block, Access::Read);
    snap.declare_snapshotted();

    // A later writer bumps the recency and mutates the bytes.
    let write_txn = conn.begin_write_txn(Durability::Hard, 1);
    let acq = write_txn.acquire(block, Access::Write);
    acq.set_recency(Recency(200));
    acq.page_for_write(&account)?.fill(0xBB);
    drop(acq);
    write_txn.commit();

    // The snapshot still observes the pre-write block.
    let page = snap.page_for_read(&account)?;
    assert!(page.iter().all(|&b| b == 0xAA));
    assert_eq!(snap.recency(), Recency(100));
    drop(page);
    drop(snap);

    // Live readers observe the new state.
    let bytes = read_block(&cache, block)?;
    assert!(bytes.iter().all(|&b| b == 0xBB));
    let acq = cache.acquire_read(block);
    assert_eq!(acq.recency(), Recency(200));
    Ok(())
}

#[test]
fn chained_writers_flush_as_one_set() -> Result<()> {
    let dir = tempdir().unwrap();
    let serializer = open_serializer(dir.path())?;
    let cache = open_cache(&serializer);
    let account = cache.default_reads_account();
    let conn = cache.new_conn();

    let block = create_filled_block(&cache, 0x00, Durability::Hard)?;
    let flushes_before = cache.stats().flushes;

    // Three transactions dirty the same block in order, none committing
    // until all have written. Without a pre-image snapshot each earlier
    // dirtier can only flush together with its successor.
    let txn_a = conn.begin_write_txn(Durability::Soft, 1);
    let acq = txn_a.acquire(block, Access::Write);
    acq.page_for_write(&account)?.fill(0xA1);
    drop(acq);

    let txn_b = conn.begin_write_txn(Durability::Soft, 1);
    let acq = txn_b.acquire(block, Access::Write);
    acq.page_for_write(&account)?.fill(0xB2);
    drop(acq);

    let txn_c = conn.begin_write_txn(Durability::Hard, 1);
    let acq = txn_c.acquire(block, Access::Write);
    acq.page_for_write(&account)?.fill(0xC3);
    drop(acq);

    // Unflushable prefixes: each commit before C's can spawn nothing.
    txn_a.commit();
    txn_b.commit();
    txn_c.commit();

    assert_eq!(
        cache.stats().flushes,
        flushes_before + 1,
        "A, B, C must go out as a single flush set"
    );

    let bytes = read_block(&cache, block)?;
    assert!(bytes.iter().all(|&b| b == 0xC3), "newest version wins");

    let token = serializer.token_for_block(block)?.expect("block indexed");
    let mut on_disk = vec![0u8; BLOCK_SIZE];
    serializer.block_read(token, &mut on_disk, &account)?;
    assert!(on_disk.iter().all(|&b| b == 0xC3));
    Ok(())
}

#[test]
fn touched_entry_never_shadows_dirtied_bytes() -> Result<()> {
    let dir = tempdir().unwrap();
    let serializer = open_serializer(dir.path())?;
    let cache = open_cache(&serializer);
    let account = cache.default_reads_account();
    let conn = cache.new_conn();

    let block = create_filled_block(&cache, 0x00, Durability::Hard)?;

    // A dirties the block at recency 10.
    let txn_a = conn.begin_write_txn(Durability::Soft, 1);
    let acq = txn_a.acquire(block, Access::Write);
    acq.page_for_write(&account)?.fill(0xAA);
    acq.set_recency(Recency(10));
    drop(acq);

    // B only bumps the recency, at a newer block version.
    let txn_b = conn.begin_write_txn(Durability::Soft, 1);
    let acq = txn_b.acquire(block, Access::Write);
    acq.set_recency(Recency(200));
    assert!(acq.touched_page());
    assert!(!acq.dirtied_page());
    drop(acq);

    // B alone cannot flush (its preceder A is still open); once A commits
    // the conn chain carries both out in one set.
    txn_b.commit();
    txn_a.commit();
    let txn_sync = conn.begin_write_txn(Durability::Hard, 0);
    txn_sync.commit();

    // The merged change keeps A's bytes under B's recency.
    let bytes = read_block(&cache, block)?;
    assert!(bytes.iter().all(|&b| b == 0xAA));
    let acq = cache.acquire_read(block);
    assert_eq!(acq.recency(), Recency(200));
    Ok(())
}

#[test]
fn writer_excluded_while_readers_queued() -> Result<()> {
    let dir = tempdir().unwrap();
    let serializer = open_serializer(dir.path())?;
    let cache = open_cache(&serializer);
    let account = cache.default_reads_account();
    let conn = cache.new_conn();

    let block = create_filled_block(&cache, 0x11, Durability::Hard)?;

    // Reader first: it is readable immediately, and the writer behind it
    // stays unwritable until the reader exits.
    let reader = cache.acquire_read(block);
    assert!(reader.read_ready().is_pulsed());

    let txn = conn.begin_write_txn(Durability::Soft, 1);
    let writer = txn.acquire(block, Access::Write);
    assert!(
        writer.read_ready().is_pulsed(),
        "the head writer would read; behind a reader it reads too"
    );
    assert!(!writer.write_ready().is_pulsed());

    let before = reader.page_for_read(&account)?;
    assert!(before.iter().all(|&b| b == 0x11));
    drop(before);
    drop(reader);

    assert!(writer.write_ready().is_pulsed());
    writer.page_for_write(&account)?.fill(0x22);

    // A reader queued behind a live writer is not readable yet.
    let late_reader = cache.acquire_read(block);
    assert!(!late_reader.read_ready().is_pulsed());
    drop(writer);
    assert!(late_reader.read_ready().is_pulsed());
    let after = late_reader.page_for_read(&account)?;
    assert!(after.iter().all(|&b| b == 0x22), "reader sees the writer's bytes");
    drop(after);
    drop(late_reader);

    txn.commit();
    Ok(())
}

#[test]
fn throttler_blocks_third_writer() -> Result<()> {
    let dir = tempdir().unwrap();
    let serializer = open_serializer(dir.path())?;
    let cache = Arc::new(open_cache(&serializer));
    // Capacity becomes min(8000, 4 * 0.5) = 2 block changes.
    cache.inform_memory_limit_change(4 * BLOCK_SIZE as u64);

    let conn = cache.new_conn();
    let account = cache.default_reads_account();

    let txn_a = conn.begin_write_txn(Durability::Hard, 1);
    let acq = txn_a.create(BlockType::Normal);
    acq.page_for_write(&account)?.fill(1);
    drop(acq);
    let txn_b = conn.begin_write_txn(Durability::Soft, 1);

    let waiter_cache = Arc::clone(&cache);
    let handle = thread::spawn(move || {
        let conn = waiter_cache.new_conn();
        let txn = conn.begin_write_txn(Durability::Soft, 1);
        txn.commit();
    });

    thread::sleep(Duration::from_millis(50));
    assert!(
        !handle.is_finished(),
        "third write txn must throttle at capacity 2"
    );

    // Committing A (hard) writes its page and retires it, freeing room.
    txn_a.commit();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "third txn never unblocked");
        thread::sleep(Duration::from_millis(5));
    }
    handle.join().unwrap();

    txn_b.commit();
    Ok(())
}

#[test]
fn deleted_block_id_is_reused_fresh() -> Result<()> {
    let dir = tempdir().unwrap();
    let serializer = open_serializer(dir.path())?;
    let cache = open_cache(&serializer);
    let account = cache.default_reads_account();
    let conn = cache.new_conn();

    let txn = conn.begin_write_txn(Durability::Hard, 1);
    let acq = txn.create(BlockType::Normal);
    let first_id = acq.block_id();
    acq.page_for_write(&account)?.fill(0xFF);
    acq.mark_deleted();
    drop(acq);
    txn.commit();

    // The id returned to the free list; on disk there is a tombstone.
    assert_eq!(serializer.token_for_block(first_id)?, None);

    let txn = conn.begin_write_txn(Durability::Hard, 1);
    let acq = txn.create(BlockType::Normal);
    assert_eq!(acq.block_id(), first_id, "freed id is vended again");
    {
        let page = acq.page_for_read(&account)?;
        assert!(
            page.iter().all(|&b| b == 0),
            "reused block starts initialized, not with the old bytes"
        );
    }
    acq.page_for_write(&account)?.fill(0x77);
    drop(acq);
    txn.commit();

    let bytes = read_block(&cache, first_id)?;
    assert!(bytes.iter().all(|&b| b == 0x77));
    Ok(())
}

#[test]
fn eviction_drops_clean_bytes_and_reloads() -> Result<()> {
    let dir = tempdir().unwrap();
    let serializer = open_serializer(dir.path())?;
    let cache = open_cache(&serializer);

    let mut blocks = Vec::new();
    for fill in 1..=4u8 {
        blocks.push(create_filled_block(&cache, fill, Durability::Hard)?);
    }

    // Squeeze the budget to two blocks: flushed pages are disk-backed, so
    // their bytes can go.
    cache.inform_memory_limit_change(2 * BLOCK_SIZE as u64);
    let stats = cache.stats();
    assert!(
        stats.page_evictions >= 2,
        "expected evictions, got {}",
        stats.page_evictions
    );

    // Every block still reads back correctly, reloading as needed.
    for (i, block) in blocks.iter().enumerate() {
        let bytes = read_block(&cache, *block)?;
        assert!(bytes.iter().all(|&b| b == i as u8 + 1));
    }
    assert!(cache.stats().page_loads >= 1);
    Ok(())
}

#[test]
fn read_ahead_populates_cache_on_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    let mut blocks = Vec::new();
    {
        let serializer = open_serializer(dir.path())?;
        let cache = open_cache(&serializer);
        for fill in 1..=5u8 {
            blocks.push(create_filled_block(&cache, fill, Durability::Hard)?);
        }
    }

    let serializer = open_serializer(dir.path())?;
    let cache = PageCache::new(
        Arc::clone(&serializer) as Arc<dyn Serializer>,
        CacheOptions {
            start_read_ahead: true,
            ..CacheOptions::default()
        },
    );

    // The serializer offers every indexed block; whichever offers lose a
    // race to user acquisition are dropped, never miscounted.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = cache.stats();
        if stats.read_ahead_accepted + stats.read_ahead_dropped >= 5 {
            break;
        }
        assert!(Instant::now() < deadline, "read-ahead never completed");
        thread::sleep(Duration::from_millis(5));
    }

    for (i, block) in blocks.iter().enumerate() {
        let bytes = read_block(&cache, *block)?;
        assert!(bytes.iter().all(|&b| b == i as u8 + 1));
    }
    // Ingested buffers serve reads without further loads.
    let stats = cache.stats();
    assert_eq!(stats.read_ahead_accepted, 5);
    assert_eq!(stats.page_loads, 0);

    cache.stop_read_ahead();
    cache.stop_read_ahead(); // idempotent
    Ok(())
}

#[test]
fn read_ahead_races_user_acquisition() -> Result<()> {
    let dir = tempdir().unwrap();
    let block;
    {
        let serializer = open_serializer(dir.path())?;
        let cache = open_cache(&serializer);
        block = create_filled_block(&cache, 0x3C, Durability::Hard)?;
    }

    // Acquire immediately after reopen, while offers may be in flight.
    let serializer = open_serializer(dir.path())?;
    let cache = PageCache::new(
        Arc::clone(&serializer) as Arc<dyn Serializer>,
        CacheOptions {
            start_read_ahead: true,
            ..CacheOptions::default()
        },
    );
    let bytes = read_block(&cache, block)?;
    assert!(
        bytes.iter().all(|&b| b == 0x3C),
        "bytes match disk whether the offer or the acquisition won"
    );
    Ok(())
}

#[test]
fn conn_drop_leaves_soft_txn_flushable() -> Result<()> {
    let dir = tempdir().unwrap();
    let serializer = open_serializer(dir.path())?;
    let cache = open_cache(&serializer);
    let account = cache.default_reads_account();

    let block;
    {
        let conn = cache.new_conn();
        let txn = conn.begin_write_txn(Durability::Soft, 1);
        let acq = txn.create(BlockType::Normal);
        block = acq.block_id();
        acq.page_for_write(&account)?.fill(0x42);
        drop(acq);
        txn.commit();
        // conn drops here with the flush possibly still in flight
    }

    let conn = cache.new_conn();
    let txn = conn.begin_write_txn(Durability::Hard, 0);
    txn.commit();

    let bytes = read_block(&cache, block)?;
    assert!(bytes.iter().all(|&b| b == 0x42));
    Ok(())
}

#[test]
fn read_txns_reap_without_flushing() -> Result<()> {
    let dir = tempdir().unwrap();
    let serializer = open_serializer(dir.path())?;
    let cache = open_cache(&serializer);

    let block = create_filled_block(&cache, 0x09, Durability::Hard)?;
    let flushes = cache.stats().flushes;

    let conn = cache.new_conn();
    for _ in 0..3 {
        let txn = conn.begin_read_txn();
        let acq = txn.acquire(block, Access::Read);
        let page = acq.page_for_read(&cache.default_reads_account())?;
        assert!(page.iter().all(|&b| b == 0x09));
        drop(page);
        drop(acq);
        txn.commit();
    }
    assert_eq!(cache.stats().flushes, flushes, "reads never flush");
    Ok(())
}
