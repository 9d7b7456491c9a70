use std::sync::atomic::{AtomicU64, Ordering};

/// I/O counters of one disk.
#[derive(Debug, Default)]
pub struct Metrics {
    pub(crate) blocks_read: AtomicU64,
    pub(crate) blocks_written: AtomicU64,
    pub(crate) read_ops: AtomicU64,
    pub(crate) write_ops: AtomicU64,
    pub(crate) segments_written: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) bytes_uploaded: AtomicU64,
    pub(crate) bytes_downloaded: AtomicU64,
}

/// Point-in-time snapshot served over the management surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub struct Status {
    pub blocks_read: u64,
    pub blocks_written: u64,
    pub iops: u64,
    pub segments_written: u64,
}

impl Metrics {
    pub(crate) fn add_read(&self, blocks: u64) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        self.blocks_read.fetch_add(blocks, Ordering::Relaxed);
    }

    pub(crate) fn add_write(&self, blocks: u64) {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        self.blocks_written.fetch_add(blocks, Ordering::Relaxed);
    }

    pub(crate) fn add_segment_written(&self, bytes: u64) {
        self.segments_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn status(&self) -> Status {
        Status {
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            iops: self.read_ops.load(Ordering::Relaxed) + self.write_ops.load(Ordering::Relaxed),
            segments_written: self.segments_written.load(Ordering::Relaxed),
        }
    }
}
