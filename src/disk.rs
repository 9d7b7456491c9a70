// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    block::{Extent, RangeData, BLOCK_SIZE},
    buffer_pool::BufferPool,
    cancel::Cancel,
    config::Config,
    extent_map::{ExtentLocation, ExtentMap, PartialExtent},
    head_map::{self, SavedMap, SavedSegment, HEAD_MAP_FILE},
    id::SegmentId,
    metrics::Metrics,
    packer,
    path::absolute_path,
    previous_cache::PreviousCache,
    segment::{file_name, reader::SegmentReader},
    segments::Segments,
    volume::{open_file_source, rewrite_atomic, SegmentAccess, VolumeInfo},
    write_cache::{WriteCache, SPILL_FILE_PREFIX},
    HashMap,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    thread::JoinHandle,
};

const USAGE_FOLDER: &str = "segment-usage";
const LOCAL_SEGMENTS_FOLDER: &str = "segments";

/// Copy chunk size when caching remote segments locally (1 MiB)
const DOWNLOAD_CHUNK: u64 = 1_024 * 1_024;

/// Everything the writer lock guards.
pub(crate) struct DiskState {
    pub(crate) map: ExtentMap,
    pub(crate) segments: Segments,
    pub(crate) wc: WriteCache,
    pub(crate) last_flushed: Option<SegmentId>,
}

/// A log-structured virtual block device.
///
/// Randomly addressable in 4 KiB blocks; durable state is an append-only
/// sequence of segments in a [`SegmentAccess`] store, fronted by an
/// in-memory write cache that spills to the local cache path.
#[derive(Clone)]
pub struct Disk(Arc<DiskInner>);

impl std::ops::Deref for Disk {
    type Target = DiskInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[allow(clippy::module_name_repetitions)]
pub struct DiskInner {
    /// Local cache path (head.map, spills, usage sidecars)
    pub path: PathBuf,

    pub(crate) volume: Arc<dyn SegmentAccess>,
    info: VolumeInfo,

    /// Volume names by disk index; `[0]` is this disk's own volume,
    /// the rest are the read-only lower layers, nearest first
    pub(crate) layers: Vec<String>,

    pub(crate) config: Config,
    pool: BufferPool,
    pub(crate) metrics: Metrics,

    pub(crate) state: RwLock<DiskState>,
    pub(crate) prev: PreviousCache,

    /// Guards rollover and packing to one at a time
    pub(crate) rollover_guard: Mutex<()>,

    /// Background segment upload, at most one in flight
    upload: Mutex<Option<JoinHandle<crate::Result<()>>>>,

    /// Open segment readers, keyed by (disk index, segment)
    readers: Mutex<HashMap<(u32, SegmentId), Arc<SegmentReader>>>,

    fatal: AtomicBool,
}

impl Disk {
    /// Opens (or creates) the configured volume as a block device.
    ///
    /// Open policy: load `head.map` if its segment hash matches the
    /// store's current segment list, otherwise rebuild the map from the
    /// segments themselves; then replay any write cache spill files so
    /// pre-crash unflushed writes survive.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open<P: Into<PathBuf>>(
        path: P,
        volume: Arc<dyn SegmentAccess>,
        config: Config,
    ) -> crate::Result<Self> {
        let path = absolute_path(path.into());
        log::info!("opening disk {:?} at {}", config.volume, path.display());

        std::fs::create_dir_all(&path)?;
        std::fs::create_dir_all(path.join(USAGE_FOLDER))?;

        let info = match volume.volume_info(&config.volume) {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                let mut info = VolumeInfo::new(&config.volume);
                if let Some(size) = config.volume_size {
                    info = info.size(size);
                }
                if let Some(parent) = &config.parent {
                    info = info.parent(parent);
                }
                volume.init_volume(&info)?
            }
            Err(e) => return Err(e),
        };

        // Walk the parent chain; index in `layers` is the disk index
        let mut layers = vec![info.name.clone()];
        let mut parent = info.parent.clone();
        while let Some(name) = parent {
            let lower = volume.volume_info(&name)?;
            layers.push(lower.name.clone());
            parent = lower.parent;
        }

        let pool = BufferPool::default();

        let (mut map, mut segments) =
            Self::load_or_rebuild(&path, volume.as_ref(), &layers)?;

        let mut wc = WriteCache::new(config.seqgen.next(), pool.clone(), Some(&path));
        segments.track(wc.id());

        Self::replay_spills(&path, &mut wc, &mut map, &mut segments)?;

        Ok(Self(Arc::new(DiskInner {
            path,
            volume,
            info,
            layers,
            config,
            pool,
            metrics: Metrics::default(),
            state: RwLock::new(DiskState {
                map,
                segments,
                wc,
                last_flushed: None,
            }),
            prev: PreviousCache::default(),
            rollover_guard: Mutex::new(()),
            upload: Mutex::new(None),
            readers: Mutex::new(HashMap::default()),
            fatal: AtomicBool::new(false),
        })))
    }

    fn load_or_rebuild(
        path: &std::path::Path,
        volume: &dyn SegmentAccess,
        layers: &[String],
    ) -> crate::Result<(ExtentMap, Segments)> {
        let own_ids = volume.list_segments(&layers[0])?;
        let current_hash = head_map::segments_hash(&own_ids);

        if let Some((saved_hash, saved)) = head_map::load(&path.join(HEAD_MAP_FILE))? {
            if saved_hash == current_hash {
                log::debug!("head map matches segment list, loading it");
                return Ok(Self::restore_saved(&saved));
            }
            log::info!("head map is stale, rebuilding from segments");
        }

        Self::rebuild_from_segments(volume, layers)
    }

    fn restore_saved(saved: &SavedMap) -> (ExtentMap, Segments) {
        let mut map = ExtentMap::default();
        let mut segments = Segments::default();

        for seg in &saved.segments {
            segments.restore(seg.id, seg.total_blocks, seg.extent_count);
        }

        // Entries are disjoint; usage re-derives through the same
        // accounting path the rebuild uses
        for pe in &saved.entries {
            let displaced = map.insert(*pe);
            debug_assert!(displaced.is_empty());

            if pe.loc.disk_index == 0 {
                segments.add_used(pe.loc.segment, pe.live.blocks);
            }
        }

        (map, segments)
    }

    /// Replays every segment of every layer, deepest lower first, own
    /// segments last, all in ULID order.
    fn rebuild_from_segments(
        volume: &dyn SegmentAccess,
        layers: &[String],
    ) -> crate::Result<(ExtentMap, Segments)> {
        let mut map = ExtentMap::default();
        let mut segments = Segments::default();

        for (disk_index, layer) in layers.iter().enumerate().rev() {
            let mut ids = volume.list_segments(layer)?;
            ids.sort_unstable();

            log::debug!("rebuilding layer {disk_index} ({layer:?}): {} segments", ids.len());

            for id in ids {
                let source = volume.open_segment(layer, id)?;

                let reader = match SegmentReader::open(id, source) {
                    Ok(reader) => reader,
                    Err(e @ crate::Error::Decode(_)) => {
                        // Bounded corruption: skip the segment, newer
                        // segments re-cover whatever it held
                        log::error!("segment {id} does not parse ({e}), skipping");
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let locations: Vec<ExtentLocation> = reader
                    .layout()
                    .iter()
                    .map(|h| ExtentLocation {
                        segment: id,
                        header: *h,
                        // NOTE: Truncation is fine, parent chains are shallow
                        #[allow(clippy::cast_possible_truncation)]
                        disk_index: disk_index as u32,
                    })
                    .collect();

                if disk_index == 0 {
                    segments.track(id);
                    for loc in &locations {
                        segments.add_frame(id, loc.header.extent.blocks);
                        segments.add_used(id, loc.header.extent.blocks);
                    }
                }

                let displaced = map.update_batch(&locations);
                segments.apply_displaced(&displaced);

                if disk_index == 0 {
                    segments.mark_durable(id);
                }
            }
        }

        Ok((map, segments))
    }

    fn replay_spills(
        path: &std::path::Path,
        wc: &mut WriteCache,
        map: &mut ExtentMap,
        segments: &mut Segments,
    ) -> crate::Result<()> {
        let mut spills: Vec<(SegmentId, PathBuf)> = Vec::new();

        for dirent in std::fs::read_dir(path)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };

            if let Some(raw_id) = name.strip_prefix(SPILL_FILE_PREFIX) {
                if let Ok(id) = SegmentId::parse(raw_id) {
                    spills.push((id, dirent.path()));
                }
            }
        }

        if spills.is_empty() {
            return Ok(());
        }

        // A crash can leave two spills (previous + current); replay both
        // in creation order to reproduce the original write order
        spills.sort_by_key(|(id, _)| *id);

        for (id, spill_path) in &spills {
            match wc.replay_file(spill_path) {
                Ok(_) => {}
                Err(e @ crate::Error::Decode(_)) => {
                    log::error!("spill of cache {id} does not parse ({e}), dropping it");
                }
                Err(e) => return Err(e),
            }
        }

        for header in wc.headers() {
            segments.add_frame(wc.id(), header.extent.blocks);
        }

        let entries: Vec<PartialExtent> = wc.entries().copied().collect();
        for pe in entries {
            let displaced = map.insert(pe);
            segments.add_used(wc.id(), pe.live.blocks);
            segments.apply_displaced(&displaced);
        }

        // Re-spill under the merged cache's own ID, then drop the old files
        wc.spill()?;
        for (_, spill_path) in &spills {
            if let Err(e) = std::fs::remove_file(spill_path) {
                log::warn!("cannot remove replayed spill {spill_path:?}: {e}");
            }
        }

        Ok(())
    }

    /// Device size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.info.size
    }

    /// Device size in blocks.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.info.size / BLOCK_SIZE as u64
    }

    /// The volume metadata this disk was opened against.
    #[must_use]
    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }

    /// I/O counter snapshot.
    #[must_use]
    pub fn status(&self) -> crate::metrics::Status {
        self.metrics.status()
    }

    fn check_usable(&self, cancel: &Cancel) -> crate::Result<()> {
        cancel.check()?;

        if self.fatal.load(Ordering::Acquire) {
            return Err(crate::Error::Fatal("disk is failed".into()));
        }
        Ok(())
    }

    fn check_bounds(&self, extent: Extent) -> crate::Result<()> {
        if extent.end() > self.block_count() {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("extent {extent} beyond device end"),
            )));
        }
        Ok(())
    }

    /// Buffers one write.
    ///
    /// Returns once the bytes are readable from the disk; segment
    /// durability needs [`Disk::close_segment`].
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    ///
    /// # Panics
    ///
    /// Panics if the byte length does not match the extent.
    pub fn write_extent(&self, extent: Extent, bytes: &[u8], cancel: &Cancel) -> crate::Result<()> {
        self.check_usable(cancel)?;
        self.check_bounds(extent)?;

        let should_roll = {
            let mut st = self.state.write().expect("lock is poisoned");
            Self::write_locked(&mut st, extent, bytes);
            st.wc.buffered_len() >= self.config.flush_threshold
        };

        self.metrics.add_write(u64::from(extent.blocks));

        if should_roll {
            self.rollover(false, cancel)?;
        }

        Ok(())
    }

    /// Buffers a batch of writes atomically (all or none become visible).
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn write_extents(&self, ranges: &[RangeData], cancel: &Cancel) -> crate::Result<()> {
        self.check_usable(cancel)?;
        for range in ranges {
            self.check_bounds(range.extent)?;
        }

        let should_roll = {
            let mut st = self.state.write().expect("lock is poisoned");

            for range in ranges {
                Self::write_locked(&mut st, range.extent, &range.data);
            }

            st.wc.buffered_len() >= self.config.flush_threshold
        };

        for range in ranges {
            self.metrics.add_write(u64::from(range.extent.blocks));
        }

        if should_roll {
            self.rollover(false, cancel)?;
        }

        Ok(())
    }

    fn write_locked(st: &mut DiskState, extent: Extent, bytes: &[u8]) {
        let header = st.wc.write_extent(extent, bytes);
        let loc = st.wc.location(header);
        Self::account_insert(st, extent, loc);
    }

    /// Marks an extent as all-zero without buffering any payload.
    ///
    /// Indistinguishable from writing zeroes; also the trim operation.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn zero_blocks(&self, extent: Extent, cancel: &Cancel) -> crate::Result<()> {
        self.check_usable(cancel)?;
        self.check_bounds(extent)?;

        // Frame sizes are u32; a whole-device trim is chunked
        const MAX_FRAME_BLOCKS: u32 = u32::MAX / BLOCK_SIZE as u32;

        {
            let mut st = self.state.write().expect("lock is poisoned");

            let mut lba = extent.lba;
            let mut remaining = extent.blocks;
            while remaining > 0 {
                let blocks = remaining.min(MAX_FRAME_BLOCKS);
                let chunk = Extent::new(lba, blocks);

                let header = st.wc.write_zero(chunk);
                let loc = st.wc.location(header);
                Self::account_insert(&mut st, chunk, loc);

                lba += u64::from(blocks);
                remaining -= blocks;
            }
        }

        self.metrics.add_write(u64::from(extent.blocks));
        Ok(())
    }

    fn account_insert(st: &mut DiskState, extent: Extent, loc: ExtentLocation) {
        let displaced = st.map.insert(PartialExtent { live: extent, loc });

        st.segments.add_frame(loc.segment, extent.blocks);
        st.segments.add_used(loc.segment, extent.blocks);
        st.segments.apply_displaced(&displaced);
    }

    /// Reads an extent, zero-filling unwritten holes.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn read_extent(&self, extent: Extent, cancel: &Cancel) -> crate::Result<RangeData> {
        self.check_usable(cancel)?;
        self.check_bounds(extent)?;

        // A pack may delete a segment between our resolve and the blob
        // read; one retry re-resolves against the rewritten map
        match self.read_once(extent, cancel) {
            Err(e) if e.is_not_found() => {
                log::debug!("segment vanished mid-read of {extent}, re-resolving");
                self.read_once(extent, cancel)
            }
            other => other,
        }
    }

    fn read_once(&self, extent: Extent, cancel: &Cancel) -> crate::Result<RangeData> {
        let mut out = vec![0u8; extent.byte_len()];

        let prev = self.prev.acquire();
        let mut stored_pieces = Vec::new();

        {
            let st = self.state.read().expect("lock is poisoned");

            for pe in st.map.resolve(extent) {
                if pe.loc.disk_index == 0 && pe.loc.segment == st.wc.id() {
                    // Write cache hit; serve while the snapshot is stable
                    let bytes = self.fail_fatal(st.wc.read_piece(&pe))?;
                    Self::copy_piece(&mut out, extent, &pe, &bytes);
                    self.metrics.add_cache_hit();
                } else {
                    stored_pieces.push(pe);
                }
            }
        }

        for pe in stored_pieces {
            cancel.check()?;

            let from_prev = prev
                .as_ref()
                .filter(|handle| pe.loc.disk_index == 0 && pe.loc.segment == handle.id());

            let bytes = if let Some(handle) = from_prev {
                self.metrics.add_cache_hit();
                self.fail_fatal(handle.read_piece(&pe))?
            } else {
                let reader = self.reader(pe.loc.disk_index, pe.loc.segment)?;
                reader.read_piece(&pe)?
            };

            Self::copy_piece(&mut out, extent, &pe, &bytes);
        }

        self.metrics.add_read(u64::from(extent.blocks));
        Ok(RangeData::new(extent, out))
    }

    fn copy_piece(out: &mut [u8], query: Extent, pe: &PartialExtent, bytes: &[u8]) {
        let start = (pe.live.lba - query.lba) as usize * BLOCK_SIZE;
        out[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Resolves a range against the current map (holes omitted).
    #[doc(hidden)]
    #[must_use]
    pub fn resolve(&self, extent: Extent) -> Vec<PartialExtent> {
        self.state
            .read()
            .expect("lock is poisoned")
            .map
            .resolve(extent)
    }

    /// Spills the write cache to the local cache path.
    ///
    /// Local durability only; no segment is uploaded.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn sync_write_cache(&self, cancel: &Cancel) -> crate::Result<()> {
        self.check_usable(cancel)?;

        let st = self.state.write().expect("lock is poisoned");
        st.wc.spill()
    }

    /// Rolls the write cache over into a segment and blocks until the
    /// segment is durable and the map reflects it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn close_segment(&self, cancel: &Cancel) -> crate::Result<()> {
        self.check_usable(cancel)?;
        self.rollover(true, cancel)
    }

    /// Final rollover plus a `head.map` snapshot.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn close(&self, cancel: &Cancel) -> crate::Result<()> {
        self.close_segment(cancel)?;
        self.save_head_map()
    }

    /// Compacts live extents into fresh segments and deletes dead ones.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn pack(&self, cancel: &Cancel) -> crate::Result<packer::PackReport> {
        self.check_usable(cancel)?;
        packer::run(self, cancel)
    }

    pub(crate) fn rollover(&self, wait: bool, cancel: &Cancel) -> crate::Result<()> {
        let _guard = self.rollover_guard.lock().expect("lock is poisoned");
        self.rollover_locked(wait, cancel)
    }

    /// Rollover body; the caller holds the rollover guard.
    pub(crate) fn rollover_locked(&self, wait: bool, cancel: &Cancel) -> crate::Result<()> {
        // Surface a failed background upload before starting another
        self.join_upload()?;
        cancel.check()?;

        let finished = {
            let mut st = self.state.write().expect("lock is poisoned");

            if st.wc.is_empty() {
                return Ok(());
            }

            let new_wc = WriteCache::new(
                self.config.seqgen.next(),
                self.pool.clone(),
                Some(&self.path),
            );
            let new_id = new_wc.id();

            let old = std::mem::replace(&mut st.wc, new_wc);
            st.segments.track(new_id);

            let finished = Arc::new(old);

            // Install the hand-off while still holding the writer lock, so
            // no reader can observe the swapped-out cache without finding
            // it in the slot; the slot is empty after join_upload, so this
            // cannot block
            self.prev.set_when_clear(finished.clone());

            finished
        };

        if wait {
            upload_previous(self, finished)
        } else {
            let disk = self.clone();
            let handle = std::thread::Builder::new()
                .name(String::from("lsvd-upload"))
                .spawn(move || upload_previous(&disk, finished))
                .expect("should spawn thread");

            *self.upload.lock().expect("lock is poisoned") = Some(handle);
            Ok(())
        }
    }

    pub(crate) fn join_upload(&self) -> crate::Result<()> {
        let handle = self.upload.lock().expect("lock is poisoned").take();

        if let Some(handle) = handle {
            return handle
                .join()
                .map_err(|_| self.fail("upload thread panicked"))?;
        }
        Ok(())
    }

    fn fail(&self, message: &str) -> crate::Error {
        self.fatal.store(true, Ordering::Release);
        log::error!("disk {:?} failed: {message}", self.info.name);
        crate::Error::Fatal(message.into())
    }

    fn fail_fatal<T>(&self, res: crate::Result<T>) -> crate::Result<T> {
        if let Err(crate::Error::Fatal(msg)) = &res {
            self.fatal.store(true, Ordering::Release);
            log::error!("disk {:?} failed: {msg}", self.info.name);
        }
        res
    }

    /// A (cached) reader for a durable segment of some layer.
    pub(crate) fn reader(
        &self,
        disk_index: u32,
        id: SegmentId,
    ) -> crate::Result<Arc<SegmentReader>> {
        if let Some(reader) = self
            .readers
            .lock()
            .expect("lock is poisoned")
            .get(&(disk_index, id))
        {
            return Ok(reader.clone());
        }

        let layer = self
            .layers
            .get(disk_index as usize)
            .ok_or_else(|| self.fail(&format!("no layer {disk_index}")))?;

        let source = if self.config.cache_segments {
            self.cached_source(layer, id)?
        } else {
            self.volume.open_segment(layer, id)?
        };

        let reader = Arc::new(SegmentReader::open(id, source)?);

        self.readers
            .lock()
            .expect("lock is poisoned")
            .insert((disk_index, id), reader.clone());

        Ok(reader)
    }

    /// Downloads a segment into the local cache once, then serves reads
    /// from the copy.
    fn cached_source(
        &self,
        layer: &str,
        id: SegmentId,
    ) -> crate::Result<Box<dyn crate::volume::SegmentSource>> {
        let folder = self.path.join(LOCAL_SEGMENTS_FOLDER);
        let local = folder.join(file_name(id));

        if !local.try_exists()? {
            std::fs::create_dir_all(&folder)?;

            let source = self.volume.open_segment(layer, id)?;
            let len = source.len();

            let mut data = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
            let mut offset = 0u64;
            while offset < len {
                let chunk = DOWNLOAD_CHUNK.min(len - offset) as usize;
                let mut buf = vec![0u8; chunk];
                source.read_at(&mut buf, offset)?;
                data.extend_from_slice(&buf);
                offset += chunk as u64;
            }

            rewrite_atomic(&local, &data)?;
            self.metrics.add_downloaded(len);
            log::debug!("cached segment {id} locally ({len} bytes)");
        }

        open_file_source(&local)
    }

    pub(crate) fn drop_reader(&self, id: SegmentId) {
        self.readers
            .lock()
            .expect("lock is poisoned")
            .retain(|(_, seg), _| *seg != id);

        if self.config.cache_segments {
            let local = self.path.join(LOCAL_SEGMENTS_FOLDER).join(file_name(id));
            if let Err(e) = std::fs::remove_file(&local) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("cannot remove cached segment {id}: {e}");
                }
            }
        }
    }

    pub(crate) fn write_usage_sidecar(&self, st: &DiskState, id: SegmentId) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let Some(usage) = st.segments.usage(id, timestamp) else {
            return;
        };

        let path = self.path.join(USAGE_FOLDER).join(format!("{id}.json"));
        match serde_json::to_vec_pretty(&usage) {
            Ok(bytes) => {
                if let Err(e) = rewrite_atomic(&path, &bytes) {
                    log::warn!("cannot write usage sidecar of {id}: {e}");
                }
            }
            Err(e) => log::warn!("cannot encode usage sidecar of {id}: {e}"),
        }
    }

    pub(crate) fn remove_usage_sidecar(&self, id: SegmentId) {
        let path = self.path.join(USAGE_FOLDER).join(format!("{id}.json"));
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("cannot remove usage sidecar of {id}: {e}");
            }
        }
    }

    /// Saves the `head.map` snapshot for fast reopen.
    fn save_head_map(&self) -> crate::Result<()> {
        let st = self.state.read().expect("lock is poisoned");

        // Only durable pieces survive a process exit; anything still in
        // the write cache is covered by its spill file
        let entries: Vec<PartialExtent> = st
            .map
            .iter()
            .filter(|pe| {
                pe.loc.disk_index != 0
                    || st
                        .segments
                        .get(pe.loc.segment)
                        .is_some_and(|stats| stats.durable && !stats.deleted)
            })
            .copied()
            .collect();

        let segments: Vec<SavedSegment> = st
            .segments
            .iter()
            .filter(|(_, stats)| stats.durable && !stats.deleted)
            .map(|(id, stats)| SavedSegment {
                id: *id,
                total_blocks: stats.total_blocks,
                extent_count: stats.extent_count,
            })
            .collect();

        let ids: Vec<SegmentId> = segments.iter().map(|s| s.id).collect();
        let hash = head_map::segments_hash(&ids);
        drop(st);

        head_map::save(
            &self.path.join(HEAD_MAP_FILE),
            &hash,
            &SavedMap { entries, segments },
        )
    }

    /// Clones the map and accounting table (test support).
    #[doc(hidden)]
    #[must_use]
    pub fn debug_state(&self) -> (ExtentMap, Segments) {
        let st = self.state.read().expect("lock is poisoned");
        (st.map.clone(), st.segments.clone())
    }

    /// Verifies the structural invariants of the map and accounting.
    #[doc(hidden)]
    pub fn check_invariants(&self) -> Result<(), String> {
        let st = self.state.read().expect("lock is poisoned");

        st.map.check_invariants()?;

        let mut live: crate::HashMap<SegmentId, u64> = crate::HashMap::default();
        for pe in st.map.iter() {
            if pe.loc.disk_index == 0 {
                *live.entry(pe.loc.segment).or_default() += u64::from(pe.live.blocks);
            }
        }

        for (id, stats) in st.segments.iter() {
            if stats.used_blocks > stats.total_blocks {
                return Err(format!("segment {id}: used exceeds total"));
            }

            let expected = live.get(id).copied().unwrap_or(0);
            if stats.used_blocks != expected {
                return Err(format!(
                    "segment {id}: used {} != live blocks {expected}",
                    stats.used_blocks,
                ));
            }
        }

        Ok(())
    }
}

/// Drains the previous cache to a new segment, marks it durable, then
/// clears the hand-off slot.
///
/// On upload failure the cache's live pieces are re-queued into the
/// active write cache (skipping ranges newer writes already cover), so
/// no acknowledged write is lost; the error surfaces to the caller.
fn upload_previous(disk: &Disk, cache: Arc<WriteCache>) -> crate::Result<()> {
    let id = cache.id();
    let bytes = cache.file_bytes();

    log::debug!(
        "uploading segment {id} ({} frames, {} bytes)",
        cache.extent_count(),
        bytes.len(),
    );

    match disk
        .volume
        .new_segment(&disk.layers[0], id, &bytes, cache.headers())
    {
        Ok(()) => {
            {
                let mut st = disk.state.write().expect("lock is poisoned");
                st.segments.mark_durable(id);
                st.last_flushed = Some(id);
                disk.write_usage_sidecar(&st, id);
            }

            disk.metrics.add_segment_written(bytes.len() as u64);
            cache.remove_spill();
            disk.prev.clear();
            Ok(())
        }
        Err(e) => {
            log::error!("upload of segment {id} failed: {e}");

            let requeued = requeue_failed_upload(disk, &cache);

            match requeued {
                Ok(()) => cache.remove_spill(),
                Err(requeue_err) => {
                    // The spill file still holds the data for the next open
                    let _ = disk.fail(&format!(
                        "cannot re-queue failed segment {id}: {requeue_err}",
                    ));
                }
            }

            disk.prev.clear();
            Err(e)
        }
    }
}

fn requeue_failed_upload(disk: &Disk, cache: &WriteCache) -> crate::Result<()> {
    let id = cache.id();
    let mut st = disk.state.write().expect("lock is poisoned");

    let entries: Vec<PartialExtent> = cache.entries().copied().collect();
    for pe in entries {
        // Only re-queue ranges the map still attributes to the failed
        // segment; newer writes stay authoritative
        let stale: Vec<PartialExtent> = st
            .map
            .resolve(pe.live)
            .into_iter()
            .filter(|cur| cur.loc.disk_index == 0 && cur.loc.segment == id)
            .collect();

        for cur in stale {
            let raw = cache.read_piece(&cur)?;
            let header = st.wc.write_extent(cur.live, &raw);
            let loc = st.wc.location(header);
            Disk::account_insert(&mut st, cur.live, loc);
        }
    }

    st.segments.remove(id);
    st.wc.spill()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{id::DeterministicGenerator, mock::MemVolume};
    use test_log::test;

    fn open_disk(dir: &std::path::Path, store: &MemVolume) -> crate::Result<Disk> {
        Disk::open(
            dir,
            Arc::new(store.clone()),
            Config::new("vol0")
                .sequence_generator(Arc::new(DeterministicGenerator::new(0xD15C)))
                .volume_size(64 * 1_024 * 1_024),
        )
    }

    #[test]
    fn open_creates_the_volume() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = MemVolume::new();

        let disk = open_disk(dir.path(), &store)?;
        assert_eq!(64 * 1_024 * 1_024, disk.size());
        assert_eq!("vol0", store.volume_info("vol0")?.name);

        Ok(())
    }

    #[test]
    fn unwritten_blocks_read_zero() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let disk = open_disk(dir.path(), &MemVolume::new())?;
        let cancel = Cancel::new();

        let data = disk.read_extent(Extent::new(100, 4), &cancel)?;
        assert!(data.data.iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn out_of_bounds_is_rejected() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let disk = open_disk(dir.path(), &MemVolume::new())?;
        let cancel = Cancel::new();

        let past_end = Extent::new(disk.block_count(), 1);
        assert!(disk.read_extent(past_end, &cancel).is_err());
        assert!(disk.zero_blocks(past_end, &cancel).is_err());

        Ok(())
    }

    #[test]
    fn cancelled_token_stops_everything() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let disk = open_disk(dir.path(), &MemVolume::new())?;

        let cancel = Cancel::new();
        cancel.cancel();

        assert!(matches!(
            disk.read_extent(Extent::new(0, 1), &cancel),
            Err(crate::Error::Cancelled),
        ));
        assert!(matches!(
            disk.write_extent(Extent::new(0, 1), &[0u8; BLOCK_SIZE], &cancel),
            Err(crate::Error::Cancelled),
        ));

        Ok(())
    }
}
