mod common;

use common::{block, durable_stats, map_entries, open_disk};
use lsvd::{Cancel, DeterministicGenerator, Extent, MemVolume};
use std::sync::Arc;
use test_log::test;

#[test]
fn close_and_reopen_preserves_data() -> lsvd::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = MemVolume::new();
    let gen = Arc::new(DeterministicGenerator::new(40));
    let cancel = Cancel::new();

    {
        let disk = open_disk(dir.path(), Arc::new(store.clone()), &gen)?;
        disk.write_extent(Extent::new(0, 1), &block(0x0A), &cancel)?;
        disk.write_extent(Extent::new(77, 1), &block(0x0B), &cancel)?;
        disk.close(&cancel)?;
    }

    {
        let disk = open_disk(dir.path(), Arc::new(store), &gen)?;
        assert_eq!(block(0x0A), disk.read_extent(Extent::new(0, 1), &cancel)?.data);
        assert_eq!(block(0x0B), disk.read_extent(Extent::new(77, 1), &cancel)?.data);

        // Never-written and zeroed ranges still read zero
        let hole = disk.read_extent(Extent::new(500, 2), &cancel)?.data;
        assert!(hole.iter().all(|&b| b == 0));
    }

    Ok(())
}

/// Three generations of LBA 0 across two segments, head.map deleted:
/// the rebuild must surface the newest version.
#[test]
fn rebuild_after_head_map_deletion() -> lsvd::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = MemVolume::new();
    let gen = Arc::new(DeterministicGenerator::new(41));
    let cancel = Cancel::new();

    {
        let disk = open_disk(dir.path(), Arc::new(store.clone()), &gen)?;

        disk.write_extent(Extent::new(0, 1), &block(0xA1), &cancel)?;
        disk.close_segment(&cancel)?;

        disk.write_extent(Extent::new(0, 1), &block(0xB2), &cancel)?;
        disk.write_extent(Extent::new(0, 1), &block(0xC3), &cancel)?;
        disk.close(&cancel)?;
    }

    std::fs::remove_file(dir.path().join("head.map"))?;

    {
        let disk = open_disk(dir.path(), Arc::new(store), &gen)?;
        assert_eq!(block(0xC3), disk.read_extent(Extent::new(0, 1), &cancel)?.data);
    }

    Ok(())
}

/// The loaded head.map state and the rebuilt state must be identical
/// (map and accounting both).
#[test]
fn loaded_and_rebuilt_states_agree() -> lsvd::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = MemVolume::new();
    let gen = Arc::new(DeterministicGenerator::new(42));
    let cancel = Cancel::new();

    {
        let disk = open_disk(dir.path(), Arc::new(store.clone()), &gen)?;

        disk.write_extent(Extent::new(0, 10), &common::blocks(10, 0x01), &cancel)?;
        disk.close_segment(&cancel)?;
        disk.write_extent(Extent::new(5, 10), &common::blocks(10, 0x02), &cancel)?;
        disk.close_segment(&cancel)?;
        disk.zero_blocks(Extent::new(8, 4), &cancel)?;
        disk.close(&cancel)?;
    }

    // Loaded from head.map
    let (loaded_map, loaded_stats) = {
        let disk = open_disk(dir.path(), Arc::new(store.clone()), &gen)?;
        (map_entries(&disk), durable_stats(&disk))
    };

    // Rebuilt from segments
    std::fs::remove_file(dir.path().join("head.map"))?;
    let (rebuilt_map, rebuilt_stats) = {
        let disk = open_disk(dir.path(), Arc::new(store), &gen)?;
        disk.check_invariants().expect("invariants hold");
        (map_entries(&disk), durable_stats(&disk))
    };

    assert_eq!(loaded_map, rebuilt_map);
    assert_eq!(loaded_stats, rebuilt_stats);

    Ok(())
}

/// Spilled but unflushed writes survive a crash (drop without close).
#[test]
fn spill_replay_recovers_unflushed_writes() -> lsvd::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = MemVolume::new();
    let gen = Arc::new(DeterministicGenerator::new(43));
    let cancel = Cancel::new();

    {
        let disk = open_disk(dir.path(), Arc::new(store.clone()), &gen)?;

        disk.write_extent(Extent::new(3, 1), &block(0x77), &cancel)?;
        disk.write_extent(Extent::new(3, 1), &block(0x88), &cancel)?;
        disk.sync_write_cache(&cancel)?;

        // Crash: no close, no segment upload
    }

    {
        let disk = open_disk(dir.path(), Arc::new(store.clone()), &gen)?;
        assert_eq!(block(0x88), disk.read_extent(Extent::new(3, 1), &cancel)?.data);
        disk.check_invariants().expect("invariants hold");

        // The replayed data flushes like any other write
        disk.close(&cancel)?;
    }

    {
        let disk = open_disk(dir.path(), Arc::new(store), &gen)?;
        assert_eq!(block(0x88), disk.read_extent(Extent::new(3, 1), &cancel)?.data);
    }

    Ok(())
}

/// A spill replay must not resurrect data that newer segments overwrote.
#[test]
fn spill_replay_respects_newer_segments() -> lsvd::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = MemVolume::new();
    let gen = Arc::new(DeterministicGenerator::new(44));
    let cancel = Cancel::new();

    {
        let disk = open_disk(dir.path(), Arc::new(store.clone()), &gen)?;
        disk.write_extent(Extent::new(0, 1), &block(0x01), &cancel)?;
        disk.sync_write_cache(&cancel)?;
        disk.write_extent(Extent::new(1, 1), &block(0x02), &cancel)?;
        disk.sync_write_cache(&cancel)?;
        // Crash with only the spill on disk
    }

    {
        let disk = open_disk(dir.path(), Arc::new(store.clone()), &gen)?;
        assert_eq!(block(0x01), disk.read_extent(Extent::new(0, 1), &cancel)?.data);
        assert_eq!(block(0x02), disk.read_extent(Extent::new(1, 1), &cancel)?.data);

        // Overwrite one block and make it durable this time
        disk.write_extent(Extent::new(0, 1), &block(0x03), &cancel)?;
        disk.close(&cancel)?;
    }

    {
        let disk = open_disk(dir.path(), Arc::new(store), &gen)?;
        assert_eq!(block(0x03), disk.read_extent(Extent::new(0, 1), &cancel)?.data);
        assert_eq!(block(0x02), disk.read_extent(Extent::new(1, 1), &cancel)?.data);
    }

    Ok(())
}

/// A corrupt head.map falls back to rebuild instead of failing the open.
#[test]
fn corrupt_head_map_falls_back_to_rebuild() -> lsvd::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = MemVolume::new();
    let gen = Arc::new(DeterministicGenerator::new(45));
    let cancel = Cancel::new();

    {
        let disk = open_disk(dir.path(), Arc::new(store.clone()), &gen)?;
        disk.write_extent(Extent::new(12, 1), &block(0x12), &cancel)?;
        disk.close(&cancel)?;
    }

    std::fs::write(dir.path().join("head.map"), b"garbage")?;

    {
        let disk = open_disk(dir.path(), Arc::new(store), &gen)?;
        assert_eq!(block(0x12), disk.read_extent(Extent::new(12, 1), &cancel)?.data);
    }

    Ok(())
}
