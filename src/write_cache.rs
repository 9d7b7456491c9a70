// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    block::Extent,
    buffer_pool::BufferPool,
    compression::{compress_frame, decompress_frame},
    extent_map::{ExtentHeader, ExtentLocation, ExtentMap, PartialExtent},
    id::SegmentId,
    segment::{parse_file, writer::encode_segment_file},
    volume::rewrite_atomic,
};
use std::path::{Path, PathBuf};

/// Filename prefix of write cache spill files
pub(crate) const SPILL_FILE_PREFIX: &str = "writecache.";

/// Slab-backed frame arena.
///
/// Frames are appended at contiguous logical offsets but live in pooled
/// 1 MiB slabs; a frame never spans two slabs. Concatenating the slab
/// contents yields exactly the payload region of the finished segment.
struct Arena {
    pool: BufferPool,
    slabs: Vec<Vec<u8>>,

    /// Logical offset at which each slab starts
    starts: Vec<u64>,

    len: u64,
}

impl Arena {
    fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            slabs: Vec::new(),
            starts: Vec::new(),
            len: 0,
        }
    }

    fn append(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.len;

        if bytes.is_empty() {
            return offset;
        }

        let fits = self
            .slabs
            .last()
            .is_some_and(|slab| slab.len() + bytes.len() <= slab.capacity());

        if !fits {
            let mut slab = self.pool.get();
            if bytes.len() > slab.capacity() {
                slab.reserve(bytes.len());
            }
            self.starts.push(self.len);
            self.slabs.push(slab);
        }

        self.slabs
            .last_mut()
            .expect("just ensured a slab")
            .extend_from_slice(bytes);
        self.len += bytes.len() as u64;

        offset
    }

    fn read(&self, offset: u64, len: usize) -> Option<&[u8]> {
        if len == 0 {
            return Some(&[]);
        }

        let idx = self.starts.partition_point(|&s| s <= offset).checked_sub(1)?;
        let slab_off = usize::try_from(offset - self.starts.get(idx).copied()?).ok()?;

        self.slabs.get(idx)?.get(slab_off..slab_off + len)
    }

    fn chunks(&self) -> Vec<&[u8]> {
        self.slabs.iter().map(Vec::as_slice).collect()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for slab in self.slabs.drain(..) {
            self.pool.put(slab);
        }
    }
}

/// Buffer of writes that have not been persisted as a segment yet.
///
/// Compresses each incoming extent into a frame, records it in a
/// cache-local extent map (overlaps within the cache split-evict like in
/// the main map) and serves reads out of the arena. The frame layout is
/// already exactly the payload layout of the segment the cache will
/// become, so flushing never re-points any offsets.
pub struct WriteCache {
    id: SegmentId,
    map: ExtentMap,
    headers: Vec<ExtentHeader>,
    arena: Arena,
    spill_path: Option<PathBuf>,
}

impl WriteCache {
    pub(crate) fn new(id: SegmentId, pool: BufferPool, spill_dir: Option<&Path>) -> Self {
        Self {
            id,
            map: ExtentMap::default(),
            headers: Vec::new(),
            arena: Arena::new(pool),
            spill_path: spill_dir.map(|dir| dir.join(format!("{SPILL_FILE_PREFIX}{id}"))),
        }
    }

    /// The segment ID this cache will be flushed under.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    #[must_use]
    pub fn extent_count(&self) -> usize {
        self.headers.len()
    }

    /// Bytes buffered in the arena.
    #[must_use]
    pub fn buffered_len(&self) -> u64 {
        self.arena.len
    }

    /// Compresses and buffers one write.
    ///
    /// # Panics
    ///
    /// Panics if the byte length does not match the extent.
    pub fn write_extent(&mut self, extent: Extent, bytes: &[u8]) -> ExtentHeader {
        assert_eq!(extent.byte_len(), bytes.len(), "write length mismatch");

        let stored = compress_frame(bytes);

        // NOTE: Truncation is fine, raw frames are bounded by u32 sizes
        #[allow(clippy::cast_possible_truncation)]
        self.push_stored(extent, &stored, bytes.len() as u32)
    }

    /// Buffers an all-zero extent without materializing the zeroes.
    pub fn write_zero(&mut self, extent: Extent) -> ExtentHeader {
        // NOTE: Truncation is fine, raw frames are bounded by u32 sizes
        #[allow(clippy::cast_possible_truncation)]
        self.push_stored(extent, &[], extent.byte_len() as u32)
    }

    /// Appends an already-encoded frame (spill replay).
    pub(crate) fn push_stored(
        &mut self,
        extent: Extent,
        stored: &[u8],
        raw_size: u32,
    ) -> ExtentHeader {
        let offset = self.arena.append(stored);

        // NOTE: Truncation is fine, stored is never larger than raw
        #[allow(clippy::cast_possible_truncation)]
        let header = ExtentHeader {
            extent,
            offset,
            compressed_size: stored.len() as u32,
            raw_size,
        };

        self.headers.push(header);
        self.map.insert(PartialExtent {
            live: extent,
            loc: self.location(header),
        });

        header
    }

    #[must_use]
    pub(crate) fn location(&self, header: ExtentHeader) -> ExtentLocation {
        ExtentLocation {
            segment: self.id,
            header,
            disk_index: 0,
        }
    }

    /// Resolves a range against the cache-local map.
    #[must_use]
    pub fn get(&self, range: Extent) -> Vec<PartialExtent> {
        self.map.resolve(range)
    }

    /// All live pieces of the cache, ascending by LBA.
    pub(crate) fn entries(&self) -> impl Iterator<Item = &PartialExtent> {
        self.map.iter()
    }

    /// Reads and decompresses one whole frame from the arena.
    pub fn read_frame(&self, header: &ExtentHeader) -> crate::Result<Vec<u8>> {
        let stored = self
            .arena
            .read(header.offset, header.compressed_size as usize)
            .ok_or_else(|| {
                crate::Error::Fatal(format!(
                    "arena lost frame at offset {} of cache {}",
                    header.offset, self.id,
                ))
            })?;

        decompress_frame(stored, header.raw_size as usize)
    }

    /// Reads the live subrange of a piece.
    pub fn read_piece(&self, pe: &PartialExtent) -> crate::Result<Vec<u8>> {
        let (start, end) = pe.raw_range();

        if pe.loc.header.is_zero() {
            return Ok(vec![0; end - start]);
        }

        let raw = self.read_frame(&pe.loc.header)?;
        raw.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
            crate::Error::Fatal(format!("piece {} escapes its frame", pe.live))
        })
    }

    /// The complete segment file bytes (for spill and upload).
    #[must_use]
    pub(crate) fn file_bytes(&self) -> Vec<u8> {
        encode_segment_file(&self.headers, &self.arena.chunks())
    }

    /// Persists the cache to its spill file, fsynced.
    ///
    /// This is local durability only; the data is not a segment yet.
    pub fn spill(&self) -> crate::Result<()> {
        let Some(path) = &self.spill_path else {
            return Ok(());
        };

        if self.is_empty() {
            return Ok(());
        }

        rewrite_atomic(path, &self.file_bytes())?;
        log::debug!(
            "spilled write cache {} ({} frames, {} bytes)",
            self.id,
            self.headers.len(),
            self.buffered_len(),
        );

        Ok(())
    }

    /// Deletes the spill file after the cache became a durable segment.
    pub(crate) fn remove_spill(&self) {
        let Some(path) = &self.spill_path else {
            return;
        };

        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("cannot remove spill file {path:?}: {e}");
            }
        }
    }

    /// Every frame appended so far, in append order.
    #[must_use]
    pub(crate) fn headers(&self) -> &[ExtentHeader] {
        &self.headers
    }

    /// Replays a spill file's frames into this cache (crash recovery).
    ///
    /// Frames are re-appended in their original order, so replaying the
    /// spills of several crashed caches in ULID order reproduces the
    /// pre-crash write order.
    pub(crate) fn replay_file(&mut self, path: &Path) -> crate::Result<usize> {
        let bytes = std::fs::read(path)?;
        let (headers, payload) = parse_file(&bytes)?;
        let count = headers.len();

        for header in headers {
            let start = usize::try_from(header.offset).map_err(|_| {
                crate::Error::Decode(crate::coding::DecodeError::InvalidHeader("Spill"))
            })?;
            let stored = payload
                .get(start..start + header.compressed_size as usize)
                .ok_or(crate::Error::Decode(
                    crate::coding::DecodeError::InvalidHeader("Spill"),
                ))?;

            self.push_stored(header.extent, stored, header.raw_size);
        }

        log::info!("replayed spill {path:?} ({count} frames)");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::BLOCK_SIZE,
        buffer_pool::SLAB_SIZE,
        id::{DeterministicGenerator, SequenceGenerator},
    };
    use test_log::test;

    fn cache() -> WriteCache {
        let gen = DeterministicGenerator::new(3);
        WriteCache::new(gen.next(), BufferPool::default(), None)
    }

    #[test]
    fn read_after_write() -> crate::Result<()> {
        let mut wc = cache();

        let data = vec![0x47; 2 * BLOCK_SIZE];
        wc.write_extent(Extent::new(10, 2), &data);

        let pieces = wc.get(Extent::new(10, 2));
        assert_eq!(1, pieces.len());
        assert_eq!(data, wc.read_piece(&pieces[0])?);

        Ok(())
    }

    #[test]
    fn overlapping_writes_last_wins() -> crate::Result<()> {
        let mut wc = cache();

        wc.write_extent(Extent::new(0, 4), &[0xAA; 4 * BLOCK_SIZE]);
        wc.write_extent(Extent::new(1, 2), &[0xBB; 2 * BLOCK_SIZE]);

        // Both frames stay buffered, but the map serves the newest bytes
        assert_eq!(2, wc.extent_count());

        let pieces = wc.get(Extent::new(0, 4));
        assert_eq!(3, pieces.len());
        assert_eq!(vec![0xAA; BLOCK_SIZE], wc.read_piece(&pieces[0])?);
        assert_eq!(vec![0xBB; 2 * BLOCK_SIZE], wc.read_piece(&pieces[1])?);
        assert_eq!(vec![0xAA; BLOCK_SIZE], wc.read_piece(&pieces[2])?);

        Ok(())
    }

    #[test]
    fn zero_write_buffers_nothing() -> crate::Result<()> {
        let mut wc = cache();

        let header = wc.write_zero(Extent::new(5, 3));
        assert_eq!(0, header.compressed_size);
        assert_eq!(0, wc.buffered_len());

        let pieces = wc.get(Extent::new(5, 3));
        assert_eq!(vec![0; 3 * BLOCK_SIZE], wc.read_piece(&pieces[0])?);

        Ok(())
    }

    #[test]
    fn arena_grows_in_slabs() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut wc = cache();

        // Incompressible frames so each write lands verbatim
        let mut rng = StdRng::seed_from_u64(3);
        let block: Vec<u8> = (0..2 * BLOCK_SIZE).map(|_| rng.gen()).collect();

        let mut lba = 0;
        while wc.buffered_len() < 3 * SLAB_SIZE as u64 {
            wc.write_extent(Extent::new(lba, 2), &block);
            lba += 2;
        }

        assert!(wc.arena.slabs.len() >= 3);

        // Every frame is still readable across slab boundaries
        for pe in wc.get(Extent::new(0, lba as u32)) {
            assert!(wc.read_piece(&pe).is_ok());
        }
    }

    #[test]
    fn spill_replay_round_trips() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let gen = DeterministicGenerator::new(4);
        let id = gen.next();

        let mut wc = WriteCache::new(id, BufferPool::default(), Some(dir.path()));
        wc.write_extent(Extent::new(0, 1), &[0x11; BLOCK_SIZE]);
        wc.write_zero(Extent::new(9, 2));
        wc.write_extent(Extent::new(0, 1), &[0x22; BLOCK_SIZE]);
        wc.spill()?;

        let path = dir.path().join(format!("{SPILL_FILE_PREFIX}{id}"));
        let mut replayed = WriteCache::new(gen.next(), BufferPool::default(), Some(dir.path()));
        assert_eq!(3, replayed.replay_file(&path)?);

        assert_eq!(wc.extent_count(), replayed.extent_count());
        assert_eq!(wc.buffered_len(), replayed.buffered_len());

        let pieces = replayed.get(Extent::new(0, 1));
        assert_eq!(vec![0x22; BLOCK_SIZE], replayed.read_piece(&pieces[0])?);

        let pieces = replayed.get(Extent::new(9, 2));
        assert_eq!(vec![0; 2 * BLOCK_SIZE], replayed.read_piece(&pieces[0])?);

        Ok(())
    }
}
