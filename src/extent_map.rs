// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    block::{Extent, Lba, BLOCK_SIZE},
    id::SegmentId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Describes one extent frame inside a segment.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExtentHeader {
    /// Logical range the frame covers
    pub extent: Extent,

    /// Byte offset of the frame payload within the segment's payload region
    pub offset: u64,

    /// Stored payload length; 0 encodes an all-zero frame, equal to
    /// `raw_size` encodes a verbatim (incompressible) payload
    pub compressed_size: u32,

    /// Uncompressed length, always `extent.blocks * BLOCK_SIZE`
    pub raw_size: u32,
}

impl ExtentHeader {
    /// Whether the frame is stored without any payload bytes.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.compressed_size == 0
    }

    /// Whether the payload is stored uncompressed.
    #[must_use]
    pub fn is_verbatim(&self) -> bool {
        self.compressed_size == self.raw_size
    }
}

/// Points at the durable (or not-yet-durable) bytes of an extent frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExtentLocation {
    /// Segment holding the frame
    pub segment: SegmentId,

    /// The frame itself
    pub header: ExtentHeader,

    /// Which layer of the disk stack owns the segment;
    /// 0 is this disk, anything above is a read-only lower
    pub disk_index: u32,
}

/// A live slice of a possibly larger on-disk extent.
///
/// `live` is always a subrange of `loc.header.extent`; overwrites shrink
/// `live` while the on-disk frame stays untouched.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PartialExtent {
    /// The authoritative subrange
    pub live: Extent,

    /// Where the bytes are
    pub loc: ExtentLocation,
}

impl PartialExtent {
    /// Byte range of `live` within the frame's *raw* (uncompressed) bytes.
    #[must_use]
    pub fn raw_range(&self) -> (usize, usize) {
        let skip = (self.live.lba - self.loc.header.extent.lba) as usize * BLOCK_SIZE;
        (skip, skip + self.live.byte_len())
    }

    fn cut_to(&self, range: &Extent) -> Option<Self> {
        self.live.intersect(range).map(|live| Self {
            live,
            loc: self.loc,
        })
    }
}

/// The authoritative, sparse LBA -> segment mapping.
///
/// Holds at most one [`PartialExtent`] per logical block. Insertion of a
/// new extent splits away whatever it overlaps; the evicted pieces remain
/// valid pointers into the same on-disk bytes and are handed back to the
/// caller for segment usage accounting.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtentMap {
    inner: BTreeMap<Lba, PartialExtent>,
}

impl ExtentMap {
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates all live pieces in strictly ascending LBA order.
    pub fn iter(&self) -> impl Iterator<Item = &PartialExtent> {
        self.inner.values()
    }

    /// First entry at or after (or overhanging into) `lba`.
    fn first_candidate(&self, lba: Lba) -> Lba {
        self.inner
            .range(..lba)
            .next_back()
            .filter(|(_, pe)| pe.live.end() > lba)
            .map_or(lba, |(&k, _)| k)
    }

    /// Returns the ordered covering of `range`, cut to the query range.
    ///
    /// Unwritten holes are omitted; the caller zero-fills them.
    #[must_use]
    pub fn resolve(&self, range: Extent) -> Vec<PartialExtent> {
        let start = self.first_candidate(range.lba);

        self.inner
            .range(start..range.end())
            .filter_map(|(_, pe)| pe.cut_to(&range))
            .collect()
    }

    /// Inserts a piece, split-evicting everything it overlaps.
    ///
    /// Returns the displaced (sub)pieces so the caller can decrement the
    /// segment usage they referenced.
    pub fn insert(&mut self, pe: PartialExtent) -> Vec<PartialExtent> {
        debug_assert!(
            pe.live.lba >= pe.loc.header.extent.lba
                && pe.live.end() <= pe.loc.header.extent.end(),
            "live range must lie within its frame",
        );

        let range = pe.live;
        let start = self.first_candidate(range.lba);

        let overlapping: Vec<PartialExtent> = self
            .inner
            .range(start..range.end())
            .map(|(_, e)| *e)
            .collect();

        let mut displaced = Vec::with_capacity(overlapping.len());

        for old in overlapping {
            self.inner.remove(&old.live.lba);

            // Left remainder keeps pointing at the same frame
            if old.live.lba < range.lba {
                // NOTE: Truncation is fine, bounded by old.live.blocks
                #[allow(clippy::cast_possible_truncation)]
                let left = Extent {
                    lba: old.live.lba,
                    blocks: (range.lba - old.live.lba) as u32,
                };
                self.inner.insert(left.lba, PartialExtent { live: left, loc: old.loc });
            }

            // Right remainder, ditto
            if old.live.end() > range.end() {
                #[allow(clippy::cast_possible_truncation)]
                let right = Extent {
                    lba: range.end(),
                    blocks: (old.live.end() - range.end()) as u32,
                };
                self.inner
                    .insert(right.lba, PartialExtent { live: right, loc: old.loc });
            }

            if let Some(mid) = old.cut_to(&range) {
                displaced.push(mid);
            }
        }

        self.inner.insert(range.lba, pe);

        displaced
    }

    /// Inserts every frame of a freshly written or replayed segment.
    ///
    /// Returns the displaced pieces of all insertions, in order. The caller
    /// holds the writer lock, which makes the batch atomic to readers.
    pub fn update_batch(&mut self, locations: &[ExtentLocation]) -> Vec<PartialExtent> {
        let mut displaced = Vec::new();

        for loc in locations {
            displaced.extend(self.insert(PartialExtent {
                live: loc.header.extent,
                loc: *loc,
            }));
        }

        displaced
    }

    /// Verifies the structural invariants, returning a violation description.
    ///
    /// Used by the torture harness; a violation in production is fatal.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut prev_end: Option<Lba> = None;

        for (key, pe) in &self.inner {
            if *key != pe.live.lba {
                return Err(format!("key {key} does not match live lba {}", pe.live.lba));
            }

            if let Some(end) = prev_end {
                if pe.live.lba < end {
                    return Err(format!("piece {} overlaps previous end {end}", pe.live));
                }
            }
            prev_end = Some(pe.live.end());

            let frame = pe.loc.header.extent;
            if pe.live.lba < frame.lba || pe.live.end() > frame.end() {
                return Err(format!("live {} escapes frame {frame}", pe.live));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{DeterministicGenerator, SequenceGenerator};

    fn loc(gen: &DeterministicGenerator, extent: Extent) -> ExtentLocation {
        ExtentLocation {
            segment: gen.next(),
            header: ExtentHeader {
                extent,
                offset: 0,
                compressed_size: 1,
                raw_size: extent.blocks * BLOCK_SIZE as u32,
            },
            disk_index: 0,
        }
    }

    fn full(loc: ExtentLocation) -> PartialExtent {
        PartialExtent {
            live: loc.header.extent,
            loc,
        }
    }

    #[test]
    fn resolve_empty_map() {
        let map = ExtentMap::default();
        assert!(map.resolve(Extent::new(0, 100)).is_empty());
    }

    #[test]
    fn insert_then_resolve_exact() {
        let gen = DeterministicGenerator::new(0);
        let mut map = ExtentMap::default();

        let a = loc(&gen, Extent::new(10, 5));
        assert!(map.insert(full(a)).is_empty());

        let got = map.resolve(Extent::new(10, 5));
        assert_eq!(vec![full(a)], got);

        // Query cut to range
        let got = map.resolve(Extent::new(12, 1));
        assert_eq!(1, got.len());
        assert_eq!(Extent::new(12, 1), got[0].live);
        assert_eq!(a, got[0].loc);
    }

    #[test]
    fn overwrite_splits_into_three() {
        let gen = DeterministicGenerator::new(0);
        let mut map = ExtentMap::default();

        let old = loc(&gen, Extent::new(0, 10));
        map.insert(full(old));

        let new = loc(&gen, Extent::new(3, 4));
        let displaced = map.insert(full(new));

        assert_eq!(1, displaced.len());
        assert_eq!(Extent::new(3, 4), displaced[0].live);
        assert_eq!(old, displaced[0].loc);

        let pieces = map.resolve(Extent::new(0, 10));
        assert_eq!(3, pieces.len());
        assert_eq!(Extent::new(0, 3), pieces[0].live);
        assert_eq!(old, pieces[0].loc);
        assert_eq!(Extent::new(3, 4), pieces[1].live);
        assert_eq!(new, pieces[1].loc);
        assert_eq!(Extent::new(7, 3), pieces[2].live);
        assert_eq!(old, pieces[2].loc);

        map.check_invariants().expect("invariants hold");
    }

    #[test]
    fn overwrite_spanning_multiple() {
        let gen = DeterministicGenerator::new(0);
        let mut map = ExtentMap::default();

        let a = loc(&gen, Extent::new(0, 4));
        let b = loc(&gen, Extent::new(4, 4));
        let c = loc(&gen, Extent::new(8, 4));
        map.insert(full(a));
        map.insert(full(b));
        map.insert(full(c));

        // Covers the tail of a, all of b, the head of c
        let new = loc(&gen, Extent::new(2, 8));
        let displaced = map.insert(full(new));

        let displaced_blocks: u32 = displaced.iter().map(|p| p.live.blocks).sum();
        assert_eq!(8, displaced_blocks);

        let pieces = map.resolve(Extent::new(0, 12));
        assert_eq!(3, pieces.len());
        assert_eq!(Extent::new(0, 2), pieces[0].live);
        assert_eq!(Extent::new(2, 8), pieces[1].live);
        assert_eq!(Extent::new(10, 2), pieces[2].live);

        map.check_invariants().expect("invariants hold");
    }

    #[test]
    fn holes_are_omitted() {
        let gen = DeterministicGenerator::new(0);
        let mut map = ExtentMap::default();

        map.insert(full(loc(&gen, Extent::new(5, 2))));
        map.insert(full(loc(&gen, Extent::new(10, 2))));

        let pieces = map.resolve(Extent::new(0, 20));
        assert_eq!(2, pieces.len());
        assert_eq!(Extent::new(5, 2), pieces[0].live);
        assert_eq!(Extent::new(10, 2), pieces[1].live);
    }

    #[test]
    fn predecessor_overhang_is_found() {
        let gen = DeterministicGenerator::new(0);
        let mut map = ExtentMap::default();

        map.insert(full(loc(&gen, Extent::new(0, 100))));

        let pieces = map.resolve(Extent::new(50, 1));
        assert_eq!(1, pieces.len());
        assert_eq!(Extent::new(50, 1), pieces[0].live);
    }

    #[test]
    fn batch_reports_all_displacements() {
        let gen = DeterministicGenerator::new(0);
        let mut map = ExtentMap::default();

        map.insert(full(loc(&gen, Extent::new(0, 10))));

        let seg = gen.next();
        let locations: Vec<ExtentLocation> = [Extent::new(0, 5), Extent::new(5, 5)]
            .into_iter()
            .map(|extent| ExtentLocation {
                segment: seg,
                header: ExtentHeader {
                    extent,
                    offset: 0,
                    compressed_size: 1,
                    raw_size: extent.blocks * BLOCK_SIZE as u32,
                },
                disk_index: 0,
            })
            .collect();

        let displaced = map.update_batch(&locations);
        let displaced_blocks: u32 = displaced.iter().map(|p| p.live.blocks).sum();
        assert_eq!(10, displaced_blocks);
        assert_eq!(2, map.len());
    }
}
