// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Log-structured virtual block device (LSVD).
//!
//! Exposes a fixed-size, randomly addressable block device whose durable
//! state is an append-only sequence of *segments* held in a segment store
//! (local directory, remote HTTP blob API, or a replicating tee over
//! two of them), fronted by a local write-back cache.
//!
//! A segment holds compressed *extent frames*:
//!
//! [e0][e1][e2][e3][e4]
//!
//! The sparse [`ExtentMap`] maps every written logical block address to
//! the frame (and byte offset) currently holding its bytes. Overwrites
//! append new frames and shrink what older frames still cover; segments
//! whose frames are fully overwritten become dead and are reclaimed by
//! [`Disk::pack`], which rewrites the remaining live extents into fresh,
//! dense segments.
//!
//! Writes land in an in-memory [`WriteCache`] (spilled to a local file
//! for crash safety) and become durable when the cache rolls over into a
//! segment; while the upload runs, reads are served from the
//! reference-counted previous-cache hand-off. The device surfaces to the
//! host kernel through the NBD protocol via [`BlockDevice`].
//!
//! # Example usage
//!
//! ```
//! use lsvd::{Cancel, Config, Disk, Extent, FsVolume, BLOCK_SIZE};
//! use std::sync::Arc;
//!
//! # fn main() -> lsvd::Result<()> {
//! # let store_dir = tempfile::tempdir()?;
//! # let cache_dir = tempfile::tempdir()?;
//! // Open or create a volume in a directory-backed store
//! let store = Arc::new(FsVolume::new(store_dir.path())?);
//! let disk = Disk::open(cache_dir.path(), store, Config::new("vol0"))?;
//!
//! let cancel = Cancel::new();
//!
//! // Write one block, read it back
//! let payload = vec![0x47; BLOCK_SIZE];
//! disk.write_extent(Extent::new(0, 1), &payload, &cancel)?;
//! assert_eq!(payload, disk.read_extent(Extent::new(0, 1), &cancel)?.data);
//!
//! // Roll the write cache into a durable segment and snapshot the map
//! disk.close(&cancel)?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![warn(clippy::multiple_crate_versions)]

mod block;
mod buffer_pool;
mod cancel;
mod coding;
mod compression;
mod config;
mod disk;
mod error;
mod extent_map;
mod head_map;
mod id;
mod metrics;
mod mock;
mod nbd;
mod packer;
mod path;
mod previous_cache;
mod remote;
mod replica;
mod segment;
mod segments;
mod version;
mod volume;
mod write_cache;

pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, xxhash_rust::xxh3::Xxh3Builder>;

pub use {
    block::{Extent, Lba, RangeData, BLOCK_SIZE},
    buffer_pool::BufferPool,
    cancel::Cancel,
    config::Config,
    disk::Disk,
    error::{Error, Result},
    extent_map::{ExtentHeader, ExtentLocation, ExtentMap, PartialExtent},
    id::{ClockGenerator, DeterministicGenerator, SegmentId, SequenceGenerator},
    metrics::Status,
    nbd::{
        BlockDevice, DiskManagement, NbdDevice, FLAG_HAS_FLAGS, FLAG_SEND_FLUSH, FLAG_SEND_TRIM,
        FLAG_SEND_WRITE_ZEROES,
    },
    packer::PackReport,
    remote::HttpVolume,
    replica::{compose_segment_list, Reconciler, TeeVolume},
    segments::{SegmentStats, SegmentUsage, Segments},
    version::Version,
    volume::{
        FsVolume, SegmentAccess, SegmentSource, VolumeInfo, DEFAULT_VOLUME_SIZE, MIN_VOLUME_SIZE,
    },
};

#[doc(hidden)]
pub use {
    previous_cache::{PrevHandle, PreviousCache},
    segment::{reader::SegmentReader, writer::SegmentBuilder},
    write_cache::WriteCache,
};

#[doc(hidden)]
pub use mock::{LatchHandle, LatchVolume, MemSource, MemVolume};
