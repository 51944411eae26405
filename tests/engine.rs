//! End-to-end scenarios driven through the public API: create, block
//! lifecycle, growth, compaction, persistence round-trip, and backing-file
//! contention.

use mmcache::{
    CacheError, CacheTable, ALLOC_QUANTUM, CACHE_USE_MAPINFO, TAG_ALL,
};

fn basename(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

/// Fresh table with the canonical two-object demo cache mapped at slot 0.
fn demo(dir: &tempfile::TempDir, n_blocks: usize) -> CacheTable {
    let table = CacheTable::new();
    table.add_object("hdr", 16, 0).unwrap();
    table.add_object("payload", 240, 0).unwrap();
    table
        .create(0, &basename(dir, "demo"), n_blocks, false, 0)
        .unwrap();
    table
}

#[test]
fn scenario_create_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let table = demo(&dir, 10);

    let stats = table.stats(0).unwrap();
    assert_eq!(stats.block_size, 256);
    assert_eq!(stats.cache_size, 2560);
    assert_eq!(stats.u_blocks, 0);
    assert_eq!(stats.n_objects, 2);
    assert_eq!(std::fs::metadata(dir.path().join("demo.mmc")).unwrap().len(), 2560);
}

#[test]
fn scenario_any_block_write_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let table = demo(&dir, 10);

    let pattern = vec![0xAB; 240];
    let block = table.add_block(&pattern, 1, None, 7, true, 0).unwrap();
    assert_eq!(block, 0); // first free block
    assert_eq!(table.stats(0).unwrap().u_blocks, 1);
    assert_eq!(table.blocktag(block, 0).unwrap(), 7);

    let guard = table.object_read(block, 1, 0).unwrap();
    assert_eq!(&guard[..], &pattern[..]);
}

#[test]
fn scenario_growth_by_allocation_quantum() {
    let dir = tempfile::tempdir().unwrap();
    let table = demo(&dir, 10);

    for i in 0..10 {
        assert_eq!(
            table.add_block(&[i as u8; 240], 1, None, 1, true, 0).unwrap(),
            i
        );
    }
    let block = table.add_block(&[0xCD; 240], 1, None, 1, true, 0).unwrap();
    assert_eq!(block, 10);

    let stats = table.stats(0).unwrap();
    assert_eq!(stats.n_blocks, 10 + ALLOC_QUANTUM);
    assert_eq!(stats.cache_size, stats.n_blocks * stats.block_size);
    assert_eq!(stats.u_blocks, 11);

    // A not-yet-written extension block reads back as zeros
    let guard = table.object_read(11, 1, 0).unwrap();
    assert!(guard.iter().all(|&b| b == 0));
    drop(guard);

    let guard = table.object_read(10, 1, 0).unwrap();
    assert!(guard.iter().all(|&b| b == 0xCD));
}

#[test]
fn scenario_compact_after_deletions() {
    let dir = tempfile::tempdir().unwrap();
    let table = demo(&dir, 10);

    for i in 0..10 {
        let mut payload = vec![0u8; 240];
        payload[0] = i as u8;
        table.add_block(&payload, 1, Some(i), i as u64, true, 0).unwrap();
    }
    for i in [2, 4, 6] {
        assert!(table.delete_block(i, 0).unwrap());
    }

    let moved = table.compact(0).unwrap();
    assert_eq!(moved, 3);

    let stats = table.stats(0).unwrap();
    assert_eq!(stats.u_blocks, 7);
    // Public cache shrinks to the smallest quantum multiple covering 7 blocks
    assert_eq!(stats.n_blocks, 8);
    assert_eq!(
        std::fs::metadata(dir.path().join("demo.mmc")).unwrap().len(),
        (8 * 256) as u64
    );

    // Survivors are contiguous from 0 in their original relative order
    let survivors = [0u8, 1, 3, 5, 7, 8, 9];
    for (pos, &orig) in survivors.iter().enumerate() {
        assert!(table.block_in_use(pos, 0).unwrap());
        assert_eq!(table.blocktag(pos, 0).unwrap(), orig as u64);
        let guard = table.object_read(pos, 1, 0).unwrap();
        assert_eq!(guard[0], orig);
    }

    // Compaction is idempotent
    assert_eq!(table.compact(0).unwrap(), 0);
    assert_eq!(table.stats(0).unwrap().u_blocks, 7);
}

#[test]
fn scenario_persistence_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let table = demo(&dir, 10);

    for i in 0..4 {
        table.add_block(&[i as u8; 240], 1, Some(i), 100 + i as u64, true, 0).unwrap();
    }
    table.set_blocklifetime(77, 1, 0).unwrap();
    table.set_auxinfo("round trip", 0).unwrap();
    table.set_colsize(5, 0).unwrap();

    let written = table
        .write_mapinfo(false, &basename(&dir, "demo"), 0, 0)
        .unwrap();
    assert_ne!(written, 0);
    let before = table.stats(0).unwrap();

    table.destroy(false, 0).unwrap();

    // Load into a different slot, then map with the persisted geometry
    let read = table.read_mapinfo(&basename(&dir, "demo"), 3).unwrap();
    assert_eq!(read, written);

    let crc = table
        .create(CACHE_USE_MAPINFO, "demo", 0, true, 3)
        .unwrap();
    assert_eq!(crc, written);

    let after = table.stats(3).unwrap();
    assert_eq!(after.n_blocks, before.n_blocks);
    assert_eq!(after.block_size, before.block_size);
    assert_eq!(after.cache_size, before.cache_size);
    assert_eq!(after.u_blocks, before.u_blocks);
    assert_eq!(after.name, "demo");

    for i in 0..4 {
        assert!(table.block_in_use(i, 3).unwrap());
        assert_eq!(table.blocktag(i, 3).unwrap(), 100 + i as u64);
        let guard = table.object_read(i, 1, 3).unwrap();
        assert!(guard.iter().all(|&b| b == i as u8));
    }
    assert_eq!(table.blocklifetime(1, 3).unwrap(), 77);
    assert_eq!(table.auxinfo(3).unwrap(), "round trip");
    assert_eq!(table.colsize(3).unwrap(), 5);
    assert!(!table.block_in_use(4, 3).unwrap());
}

#[test]
fn scenario_double_map_contention() {
    let dir = tempfile::tempdir().unwrap();
    let table = demo(&dir, 10);
    table.add_block(&[1u8; 16], 0, Some(0), 0, true, 0).unwrap();

    // A second mapping attempt on the same backing file must fail cleanly
    let other = CacheTable::new();
    other.add_object("hdr", 16, 0).unwrap();
    other.add_object("payload", 240, 0).unwrap();
    match other.create(0, &basename(&dir, "demo"), 10, false, 0) {
        Err(CacheError::Locked { .. }) => {}
        res => panic!("expected Locked, got {res:?}"),
    }

    // The first mapping is unharmed
    assert!(table.block_in_use(0, 0).unwrap());
    let guard = table.object_read(0, 0, 0).unwrap();
    assert_eq!(&guard[..], &[1u8; 16][..]);
}

#[test]
fn scenario_corruption_detected_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let table = demo(&dir, 4);
    table.add_block(&[9u8; 240], 1, Some(0), 1, true, 0).unwrap();

    let written = table
        .write_mapinfo(false, &basename(&dir, "demo"), 0, 0)
        .unwrap();
    table.destroy(false, 0).unwrap();

    // Flip one byte of the data file behind the engine's back
    let mmc = dir.path().join("demo.mmc");
    let mut bytes = std::fs::read(&mmc).unwrap();
    bytes[17] ^= 0x01;
    std::fs::write(&mmc, &bytes).unwrap();

    assert_eq!(table.read_mapinfo(&basename(&dir, "demo"), 0).unwrap(), written);
    match table.create(CACHE_USE_MAPINFO, "demo", 0, true, 0) {
        Err(CacheError::Corrupt { stored, .. }) => assert_eq!(stored, written),
        other => panic!("expected Corrupt, got {other:?}"),
    }
    // No dangling mapping survives the teardown
    assert!(!table.is_allocated(0).unwrap());
    assert!(!table.is_mapped(0).unwrap());
}

#[test]
fn scenario_delete_restore_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    let table = demo(&dir, 4);
    table.add_block(&[1u8; 16], 0, Some(1), 0, true, 0).unwrap();

    assert!(table.delete_block(1, 0).unwrap());
    assert!(!table.delete_block(1, 0).unwrap());
    assert_eq!(table.stats(0).unwrap().u_blocks, 0);

    assert!(table.restore_block(1, 0).unwrap());
    assert!(!table.restore_block(1, 0).unwrap());
    assert_eq!(table.stats(0).unwrap().u_blocks, 1);
}

#[test]
fn scenario_clear_selective_and_total() {
    let dir = tempfile::tempdir().unwrap();
    let table = demo(&dir, 8);
    for i in 0..8 {
        let tag = if i < 5 { 1 } else { 2 };
        table.add_block(&[1u8; 16], 0, Some(i), tag, true, 0).unwrap();
    }

    assert_eq!(table.clear(2, 0).unwrap(), 3);
    assert_eq!(table.stats(0).unwrap().u_blocks, 5);
    // Object geometry survives a clear
    assert_eq!(table.stats(0).unwrap().n_objects, 2);
    assert!(table.add_block(&[2u8; 16], 0, None, 1, true, 0).is_ok());

    assert_eq!(table.clear(TAG_ALL, 0).unwrap(), 6);
    assert_eq!(table.stats(0).unwrap().u_blocks, 0);
}

#[test]
fn scenario_archive_and_extract() {
    let dir = tempfile::tempdir().unwrap();
    let table = demo(&dir, 4);
    table.add_block(&[5u8; 240], 1, Some(0), 3, true, 0).unwrap();
    table
        .write_mapinfo(false, &basename(&dir, "demo"), 0, 0)
        .unwrap();
    table.destroy(false, 0).unwrap();

    let base = basename(&dir, "demo");
    let map_bytes = std::fs::read(dir.path().join("demo.map")).unwrap();
    let mmc_bytes = std::fs::read(dir.path().join("demo.mmc")).unwrap();

    let archive_path = mmcache::archive(false, true, &base).unwrap();
    assert!(archive_path.exists());
    assert!(!dir.path().join("demo.mmc").exists());

    mmcache::extract(&base).unwrap();
    assert_eq!(std::fs::read(dir.path().join("demo.map")).unwrap(), map_bytes);
    assert_eq!(std::fs::read(dir.path().join("demo.mmc")).unwrap(), mmc_bytes);

    // The extracted pair is mappable again
    assert_eq!(table.read_mapinfo(&base, 0).unwrap(), table.stats(0).unwrap().crc);
    table.create(CACHE_USE_MAPINFO, "demo", 0, true, 0).unwrap();
    let guard = table.object_read(0, 1, 0).unwrap();
    assert!(guard.iter().all(|&b| b == 5));
}

#[test]
fn scenario_merge_two_pools() {
    let dir = tempfile::tempdir().unwrap();
    let table = CacheTable::new();
    for (idx, name) in [(0usize, "left"), (1, "right")] {
        table.add_object("hdr", 16, idx).unwrap();
        table.add_object("payload", 240, idx).unwrap();
        table
            .create(0, &basename(&dir, name), 3, false, idx)
            .unwrap();
    }
    table.add_block(&[1u8; 240], 1, Some(0), 10, true, 0).unwrap();
    table.add_block(&[2u8; 240], 1, Some(2), 20, true, 1).unwrap();

    let merged = table.merge(0, 1, 99).unwrap();
    assert_eq!(merged, 3);

    let stats = table.stats(0).unwrap();
    assert_eq!(stats.n_blocks, 6);
    assert_eq!(stats.u_blocks, 2);

    assert!(table.block_in_use(5, 0).unwrap());
    assert_eq!(table.blocktag(5, 0).unwrap(), 99);
    let guard = table.object_read(5, 1, 0).unwrap();
    assert!(guard.iter().all(|&b| b == 2));
    drop(guard);

    // Merge source stays intact
    assert_eq!(table.stats(1).unwrap().u_blocks, 1);
    table.destroy(true, 1).unwrap();
}
