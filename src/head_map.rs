// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    extent_map::PartialExtent, id::SegmentId, version::Version, volume::rewrite_atomic,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Filename of the saved LBA map
pub(crate) const HEAD_MAP_FILE: &str = "head.map";

/// Length of the segment list hash
pub(crate) const HASH_LEN: usize = 32;

/// Per-segment totals persisted alongside the map so a loaded state is
/// indistinguishable from a rebuilt one.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct SavedSegment {
    pub id: SegmentId,
    pub total_blocks: u64,
    pub extent_count: u64,
}

/// CBOR body of `head.map`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct SavedMap {
    pub entries: Vec<PartialExtent>,
    pub segments: Vec<SavedSegment>,
}

/// Hash of a segment ID set, order-independent.
pub(crate) fn segments_hash(ids: &[SegmentId]) -> [u8; HASH_LEN] {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    for id in sorted {
        hasher.update(&id.to_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// Atomically writes `magic || version || segments_hash || cbor(body)`.
pub(crate) fn save(path: &Path, hash: &[u8; HASH_LEN], body: &SavedMap) -> crate::Result<()> {
    let mut bytes = Vec::new();

    Version::V0.write_file_header(&mut bytes)?;
    bytes.extend_from_slice(hash);

    ciborium::into_writer(body, &mut bytes).map_err(|e| {
        log::error!("cannot encode head map: {e}");
        crate::Error::Encode(crate::coding::EncodeError::Io(std::io::Error::other(
            "cbor encode",
        )))
    })?;

    rewrite_atomic(path, &bytes)?;
    log::debug!(
        "saved head map ({} entries, {} segments)",
        body.entries.len(),
        body.segments.len(),
    );

    Ok(())
}

/// Loads a saved map.
///
/// Returns `None` when the file is missing, carries an unknown version or
/// does not parse; all of those mean "rebuild from segments".
pub(crate) fn load(path: &Path) -> crate::Result<Option<([u8; HASH_LEN], SavedMap)>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if Version::parse_file_header(&bytes).is_none() {
        log::warn!("head map has an unknown version, rebuilding from segments");
        return Ok(None);
    }

    let rest = &bytes[Version::len()..];

    let Some(hash) = rest.get(..HASH_LEN) else {
        log::warn!("head map is truncated, rebuilding from segments");
        return Ok(None);
    };
    let hash: [u8; HASH_LEN] = hash.try_into().expect("32 bytes");

    match ciborium::from_reader::<SavedMap, _>(&rest[HASH_LEN..]) {
        Ok(body) => Ok(Some((hash, body))),
        Err(e) => {
            log::warn!("head map does not parse ({e}), rebuilding from segments");
            Ok(None)
        }
    }
}
