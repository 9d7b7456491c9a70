// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{extent_map::PartialExtent, id::SegmentId, HashMap};

/// Accounting for one segment of this disk's own layer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SegmentStats {
    /// Sum of the block counts of every extent frame in the segment
    pub total_blocks: u64,

    /// Blocks still referenced by the extent map
    pub used_blocks: u64,

    /// Number of extent frames
    pub extent_count: u64,

    /// Whether the segment has been uploaded to the store
    pub durable: bool,

    /// Whether deletion has been issued against the store
    pub deleted: bool,
}

impl SegmentStats {
    /// Percentage of the segment that is still live.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn density_pct(&self) -> f32 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        self.used_blocks as f32 / self.total_blocks as f32 * 100.0
    }
}

/// Usage sidecar written next to the local cache (`segment-usage/<ULID>.json`).
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct SegmentUsage {
    pub extent_count: u64,
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub density_pct: f32,
    pub timestamp: u64,
}

/// Per-segment live-block accounting.
///
/// `used` is derived purely from extent map displacements: whenever a
/// piece of segment S is split away, S loses that many blocks. A durable
/// segment whose `used` reaches 0 is dead and eligible for deletion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Segments {
    inner: HashMap<SegmentId, SegmentStats>,
}

impl Segments {
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: SegmentId) -> Option<&SegmentStats> {
        self.inner.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SegmentId, &SegmentStats)> {
        self.inner.iter()
    }

    /// IDs in ULID (creation-time) order.
    #[must_use]
    pub fn ids_sorted(&self) -> Vec<SegmentId> {
        let mut ids: Vec<_> = self.inner.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Starts tracking a segment that is being filled.
    pub fn track(&mut self, id: SegmentId) {
        self.inner.entry(id).or_default();
    }

    /// Restores a fully known entry (head.map load path).
    pub fn restore(&mut self, id: SegmentId, total_blocks: u64, extent_count: u64) {
        self.inner.insert(
            id,
            SegmentStats {
                total_blocks,
                used_blocks: 0,
                extent_count,
                durable: true,
                deleted: false,
            },
        );
    }

    /// Accounts one appended extent frame.
    pub fn add_frame(&mut self, id: SegmentId, blocks: u32) {
        let stats = self.inner.entry(id).or_default();
        stats.total_blocks += u64::from(blocks);
        stats.extent_count += 1;
    }

    /// Accounts blocks that became live in `id`.
    pub fn add_used(&mut self, id: SegmentId, blocks: u32) {
        let stats = self.inner.entry(id).or_default();
        stats.used_blocks += u64::from(blocks);
    }

    /// Accounts map displacements; pieces of lower layers are ignored.
    pub fn apply_displaced(&mut self, displaced: &[PartialExtent]) {
        for pe in displaced {
            if pe.loc.disk_index != 0 {
                continue;
            }

            if let Some(stats) = self.inner.get_mut(&pe.loc.segment) {
                stats.used_blocks = stats.used_blocks.saturating_sub(u64::from(pe.live.blocks));
            } else {
                log::warn!(
                    "displaced piece references untracked segment {}",
                    pe.loc.segment,
                );
            }
        }
    }

    pub fn mark_durable(&mut self, id: SegmentId) {
        if let Some(stats) = self.inner.get_mut(&id) {
            stats.durable = true;
        }
    }

    pub fn mark_deleted(&mut self, id: SegmentId) {
        if let Some(stats) = self.inner.get_mut(&id) {
            stats.deleted = true;
        }
    }

    pub fn remove(&mut self, id: SegmentId) {
        self.inner.remove(&id);
    }

    /// Durable segments without any live blocks, minus the exclusions
    /// (the active write cache and the most recently flushed segment).
    #[must_use]
    pub fn dead(&self, exclude: &[SegmentId]) -> Vec<SegmentId> {
        let mut dead: Vec<_> = self
            .inner
            .iter()
            .filter(|(id, stats)| {
                stats.durable && stats.used_blocks == 0 && !exclude.contains(id)
            })
            .map(|(id, _)| *id)
            .collect();
        dead.sort_unstable();
        dead
    }

    /// The usage sidecar document for a segment.
    #[must_use]
    pub fn usage(&self, id: SegmentId, timestamp: u64) -> Option<SegmentUsage> {
        self.get(id).map(|stats| SegmentUsage {
            extent_count: stats.extent_count,
            total_blocks: stats.total_blocks,
            used_blocks: stats.used_blocks,
            density_pct: stats.density_pct(),
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::{Extent, BLOCK_SIZE},
        extent_map::{ExtentHeader, ExtentLocation},
        id::{DeterministicGenerator, SequenceGenerator},
    };

    fn piece(segment: SegmentId, extent: Extent, disk_index: u32) -> PartialExtent {
        PartialExtent {
            live: extent,
            loc: ExtentLocation {
                segment,
                header: ExtentHeader {
                    extent,
                    offset: 0,
                    compressed_size: 1,
                    raw_size: extent.blocks * BLOCK_SIZE as u32,
                },
                disk_index,
            },
        }
    }

    #[test]
    fn usage_accounting() {
        let gen = DeterministicGenerator::new(0);
        let id = gen.next();

        let mut segs = Segments::default();
        segs.track(id);
        segs.add_frame(id, 10);
        segs.add_used(id, 10);
        segs.add_frame(id, 5);
        segs.add_used(id, 5);

        let stats = segs.get(id).expect("tracked");
        assert_eq!(15, stats.total_blocks);
        assert_eq!(15, stats.used_blocks);
        assert_eq!(2, stats.extent_count);

        segs.apply_displaced(&[piece(id, Extent::new(0, 6), 0)]);
        assert_eq!(9, segs.get(id).expect("tracked").used_blocks);

        // Lower-layer displacements do not touch the table
        segs.apply_displaced(&[piece(id, Extent::new(6, 4), 1)]);
        assert_eq!(9, segs.get(id).expect("tracked").used_blocks);
    }

    #[test]
    fn dead_selection() {
        let gen = DeterministicGenerator::new(0);
        let a = gen.next();
        let b = gen.next();
        let c = gen.next();

        let mut segs = Segments::default();
        for id in [a, b, c] {
            segs.track(id);
            segs.add_frame(id, 4);
        }
        segs.mark_durable(a);
        segs.mark_durable(b);
        segs.add_used(b, 4);

        // a: durable + unused -> dead; b: still used; c: not durable
        assert_eq!(vec![a], segs.dead(&[]));
        assert!(segs.dead(&[a]).is_empty());
    }
}
