mod common;

use common::{blocks, durable_stats, open_disk};
use lsvd::{Cancel, DeterministicGenerator, Extent, MemVolume};
use std::sync::Arc;
use test_log::test;

/// Overlapping writes within one segment: 10 + 20 + 15 blocks written,
/// then 9 + 9 of them overwritten. total = 63, used = 45.
#[test]
fn usage_accounting_over_overlapping_writes() -> lsvd::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = MemVolume::new();
    let gen = Arc::new(DeterministicGenerator::new(30));
    let cancel = Cancel::new();

    let expected = {
        let disk = open_disk(dir.path(), Arc::new(store.clone()), &gen)?;

        disk.write_extent(Extent::new(0, 10), &blocks(10, 0x01), &cancel)?;
        disk.write_extent(Extent::new(100, 20), &blocks(20, 0x02), &cancel)?;
        disk.write_extent(Extent::new(200, 15), &blocks(15, 0x03), &cancel)?;

        disk.write_extent(Extent::new(100, 9), &blocks(9, 0x04), &cancel)?;
        disk.write_extent(Extent::new(200, 9), &blocks(9, 0x05), &cancel)?;

        disk.close(&cancel)?;

        let stats = durable_stats(&disk);
        assert_eq!(1, stats.len());

        let (_, total, used, extents) = stats[0];
        assert_eq!(63, total);
        assert_eq!(45, used);
        assert_eq!(5, extents);

        disk.check_invariants().expect("invariants hold");
        stats
    };

    // Rebuild from segments must reproduce the identical accounting
    std::fs::remove_file(dir.path().join("head.map"))?;

    let disk = open_disk(dir.path(), Arc::new(store), &gen)?;
    assert_eq!(expected, durable_stats(&disk));
    disk.check_invariants().expect("invariants hold");

    Ok(())
}

#[test]
fn trim_drains_usage() -> lsvd::Result<()> {
    let dir = tempfile::tempdir()?;
    let gen = Arc::new(DeterministicGenerator::new(31));
    let disk = open_disk(dir.path(), Arc::new(MemVolume::new()), &gen)?;
    let cancel = Cancel::new();

    disk.write_extent(Extent::new(0, 16), &blocks(16, 0x11), &cancel)?;
    disk.close_segment(&cancel)?;

    // Trim everything the segment held; the zero frames live in the
    // write cache, the old segment keeps only garbage
    disk.zero_blocks(Extent::new(0, 16), &cancel)?;

    let stats = durable_stats(&disk);
    assert_eq!(1, stats.len());
    let (_, total, used, _) = stats[0];
    assert_eq!(16, total);
    assert_eq!(0, used);

    disk.check_invariants().expect("invariants hold");
    Ok(())
}
