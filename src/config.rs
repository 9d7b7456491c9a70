// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::id::{ClockGenerator, SequenceGenerator};
use std::sync::Arc;

/// Disk configuration
pub struct Config {
    /// Volume the disk persists into
    pub(crate) volume: String,

    /// Size in bytes used when the volume does not exist yet
    pub(crate) volume_size: Option<u64>,

    /// Read-only lower volume used when creating the volume
    pub(crate) parent: Option<String>,

    /// Write cache high-water mark triggering a rollover
    pub(crate) flush_threshold: u64,

    /// Segment ID generator
    pub(crate) seqgen: Arc<dyn SequenceGenerator>,

    /// Keep local copies of remote segments under the cache path
    pub(crate) cache_segments: bool,
}

impl Config {
    /// Creates a configuration for the given volume name.
    #[must_use]
    pub fn new(volume: &str) -> Self {
        Self {
            volume: volume.into(),
            volume_size: None,
            parent: None,
            flush_threshold: 8 * 1_024 * 1_024,
            seqgen: Arc::new(ClockGenerator::default()),
            cache_segments: false,
        }
    }

    /// Sets the size used when the volume is created.
    ///
    /// Default = 100 GiB
    #[must_use]
    pub fn volume_size(mut self, bytes: u64) -> Self {
        self.volume_size = Some(bytes);
        self
    }

    /// Stacks the new volume on a read-only lower volume.
    #[must_use]
    pub fn parent(mut self, volume: &str) -> Self {
        self.parent = Some(volume.into());
        self
    }

    /// Sets the write cache size at which a segment rollover starts.
    ///
    /// Default = 8 MiB
    #[must_use]
    pub fn flush_threshold(mut self, bytes: u64) -> Self {
        self.flush_threshold = bytes;
        self
    }

    /// Swaps the segment ID generator.
    ///
    /// Tests install a deterministic generator so segment filenames
    /// reproduce from a seed; the same instance must be reused across
    /// reopens of one disk.
    #[must_use]
    pub fn sequence_generator(mut self, seqgen: Arc<dyn SequenceGenerator>) -> Self {
        self.seqgen = seqgen;
        self
    }

    /// Keeps local copies of remote segments under the cache path.
    #[must_use]
    pub fn cache_segments(mut self, cache: bool) -> Self {
        self.cache_segments = cache;
        self
    }
}
