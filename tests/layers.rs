mod common;

use common::{block, blocks};
use lsvd::{Cancel, Config, DeterministicGenerator, Disk, Extent, MemVolume, BLOCK_SIZE};
use std::sync::Arc;
use test_log::test;

fn open(
    dir: &std::path::Path,
    store: &MemVolume,
    gen: &Arc<DeterministicGenerator>,
    volume: &str,
    parent: Option<&str>,
) -> lsvd::Result<Disk> {
    let mut config = Config::new(volume)
        .sequence_generator(gen.clone())
        .volume_size(16 * 1_024 * 1_024);
    if let Some(parent) = parent {
        config = config.parent(parent);
    }
    Disk::open(dir, Arc::new(store.clone()), config)
}

#[test]
fn child_reads_through_to_parent() -> lsvd::Result<()> {
    let store = MemVolume::new();
    let gen = Arc::new(DeterministicGenerator::new(80));
    let cancel = Cancel::new();

    // Base volume with some data
    {
        let base_dir = tempfile::tempdir()?;
        let base = open(base_dir.path(), &store, &gen, "base", None)?;
        base.write_extent(Extent::new(0, 4), &blocks(4, 0xBA), &cancel)?;
        base.write_extent(Extent::new(100, 1), &block(0x5E), &cancel)?;
        base.close(&cancel)?;
    }

    // Copy-on-write child on top
    let child_dir = tempfile::tempdir()?;
    let child = open(child_dir.path(), &store, &gen, "child", Some("base"))?;

    assert_eq!(
        blocks(4, 0xBA),
        child.read_extent(Extent::new(0, 4), &cancel)?.data,
    );
    assert_eq!(
        block(0x5E),
        child.read_extent(Extent::new(100, 1), &cancel)?.data,
    );

    Ok(())
}

#[test]
fn child_writes_shadow_the_parent() -> lsvd::Result<()> {
    let store = MemVolume::new();
    let gen = Arc::new(DeterministicGenerator::new(81));
    let cancel = Cancel::new();

    let base_dir = tempfile::tempdir()?;
    {
        let base = open(base_dir.path(), &store, &gen, "base", None)?;
        base.write_extent(Extent::new(0, 4), &blocks(4, 0x01), &cancel)?;
        base.close(&cancel)?;
    }

    let child_dir = tempfile::tempdir()?;
    {
        let child = open(child_dir.path(), &store, &gen, "child", Some("base"))?;

        // Overwrite the middle; the edges keep reading through
        child.write_extent(Extent::new(1, 2), &blocks(2, 0x02), &cancel)?;
        child.close(&cancel)?;

        let got = child.read_extent(Extent::new(0, 4), &cancel)?.data;
        assert_eq!(block(0x01), got[..BLOCK_SIZE]);
        assert_eq!(blocks(2, 0x02), got[BLOCK_SIZE..3 * BLOCK_SIZE]);
        assert_eq!(block(0x01), got[3 * BLOCK_SIZE..]);
    }

    // The parent is untouched
    {
        let base = open(base_dir.path(), &store, &gen, "base", None)?;
        assert_eq!(
            blocks(4, 0x01),
            base.read_extent(Extent::new(0, 4), &cancel)?.data,
        );
    }

    Ok(())
}

#[test]
fn pack_flattens_the_stack() -> lsvd::Result<()> {
    let store = MemVolume::new();
    let gen = Arc::new(DeterministicGenerator::new(82));
    let cancel = Cancel::new();

    {
        let base_dir = tempfile::tempdir()?;
        let base = open(base_dir.path(), &store, &gen, "base", None)?;
        base.write_extent(Extent::new(0, 8), &blocks(8, 0x11), &cancel)?;
        base.close(&cancel)?;
    }

    let child_dir = tempfile::tempdir()?;
    let child = open(child_dir.path(), &store, &gen, "child", Some("base"))?;
    child.write_extent(Extent::new(4, 8), &blocks(8, 0x22), &cancel)?;
    child.close_segment(&cancel)?;

    child.pack(&cancel)?;

    // Everything now lives in the child's own layer
    for pe in child.resolve(Extent::new(0, 12)) {
        assert_eq!(0, pe.loc.disk_index);
    }

    let got = child.read_extent(Extent::new(0, 12), &cancel)?.data;
    assert_eq!(blocks(4, 0x11), got[..4 * BLOCK_SIZE]);
    assert_eq!(blocks(8, 0x22), got[4 * BLOCK_SIZE..]);

    child.check_invariants().expect("invariants hold");
    Ok(())
}
