// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

#![allow(dead_code)]

use lsvd::{
    Config, DeterministicGenerator, Disk, SegmentAccess, SegmentId, BLOCK_SIZE,
};
use std::{path::Path, sync::Arc};

pub const VOLUME: &str = "vol0";

/// 64 MiB device keeps the tests snappy
pub const TEST_VOLUME_SIZE: u64 = 64 * 1_024 * 1_024;

pub fn open_disk(
    dir: &Path,
    store: Arc<dyn SegmentAccess>,
    gen: &Arc<DeterministicGenerator>,
) -> lsvd::Result<Disk> {
    Disk::open(
        dir,
        store,
        Config::new(VOLUME)
            .sequence_generator(gen.clone())
            .volume_size(TEST_VOLUME_SIZE),
    )
}

/// One block filled with `byte`.
pub fn block(byte: u8) -> Vec<u8> {
    vec![byte; BLOCK_SIZE]
}

/// `n` blocks filled with `byte`.
pub fn blocks(n: u32, byte: u8) -> Vec<u8> {
    vec![byte; n as usize * BLOCK_SIZE]
}

/// The canonical first-write payload: half 0x47, padded with zeroes.
pub fn test_extent_payload() -> Vec<u8> {
    let mut payload = vec![0u8; BLOCK_SIZE];
    payload[..BLOCK_SIZE / 2].fill(0x47);
    payload
}

/// Durable per-segment accounting, sorted by ID, for state comparisons
/// across reopen/rebuild (the active write cache entry differs by design).
pub fn durable_stats(disk: &Disk) -> Vec<(SegmentId, u64, u64, u64)> {
    let (_, segments) = disk.debug_state();

    let mut stats: Vec<_> = segments
        .iter()
        .filter(|(_, s)| s.durable && !s.deleted)
        .map(|(id, s)| (*id, s.total_blocks, s.used_blocks, s.extent_count))
        .collect();
    stats.sort_unstable_by_key(|(id, ..)| *id);
    stats
}

/// Flattened live map for state comparisons.
pub fn map_entries(disk: &Disk) -> Vec<lsvd::PartialExtent> {
    let (map, _) = disk.debug_state();
    map.iter().copied().collect()
}
