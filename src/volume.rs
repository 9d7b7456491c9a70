// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    extent_map::ExtentHeader,
    id::SegmentId,
    segment::{file_name, SEGMENT_FILE_PREFIX},
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{Read, Seek, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Default volume size (100 GiB)
pub const DEFAULT_VOLUME_SIZE: u64 = 100 * 1_024 * 1_024 * 1_024;

/// Smallest accepted volume size (1 MiB)
pub const MIN_VOLUME_SIZE: u64 = 1_024 * 1_024;

/// Metadata of one named volume.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,

    /// Device size in bytes
    pub size: u64,

    /// Read-only lower volume this one copy-on-writes over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    pub uuid: String,
}

impl VolumeInfo {
    /// Creates volume metadata with the default size and a fresh UUID.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            size: DEFAULT_VOLUME_SIZE,
            parent: None,
            uuid: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Sets the device size.
    #[must_use]
    pub fn size(mut self, bytes: u64) -> Self {
        self.size = bytes;
        self
    }

    /// Stacks the volume on a read-only lower.
    #[must_use]
    pub fn parent(mut self, name: &str) -> Self {
        self.parent = Some(name.into());
        self
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.size < MIN_VOLUME_SIZE {
            return Err(crate::Error::Conflict(format!(
                "volume size {} below minimum {MIN_VOLUME_SIZE}",
                self.size,
            )));
        }
        Ok(())
    }
}

/// Ranged reads over one segment blob.
pub trait SegmentSource: Send + Sync {
    /// Total blob length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()>;

    /// MD5 of the whole blob, when the store advertises one.
    fn content_md5(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Typed blob I/O against a named volume's segment store.
///
/// Implemented by the local filesystem store, the remote HTTP store, and
/// the replicating tee over two of them.
pub trait SegmentAccess: Send + Sync {
    /// Creates the volume; fails with `Conflict` when it already exists.
    fn init_volume(&self, info: &VolumeInfo) -> crate::Result<VolumeInfo>;

    /// Fetches volume metadata.
    fn volume_info(&self, name: &str) -> crate::Result<VolumeInfo>;

    /// All segment IDs of the volume in creation order.
    fn list_segments(&self, volume: &str) -> crate::Result<Vec<SegmentId>>;

    /// Opens a segment blob for ranged reads.
    fn open_segment(&self, volume: &str, id: SegmentId) -> crate::Result<Box<dyn SegmentSource>>;

    /// Stores a finished segment and registers it with the volume.
    ///
    /// `layout` mirrors the in-file extent headers; stores may persist it
    /// as a sidecar for reconciliation.
    fn new_segment(
        &self,
        volume: &str,
        id: SegmentId,
        data: &[u8],
        layout: &[ExtentHeader],
    ) -> crate::Result<()>;

    /// Unregisters and deletes a segment.
    fn remove_segment(&self, volume: &str, id: SegmentId) -> crate::Result<()>;
}

/// Atomically rewrites a file
pub(crate) fn rewrite_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> std::io::Result<()> {
    let path = path.as_ref();
    let folder = path.parent().expect("should have a parent");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.persist(path)?;

    #[cfg(not(target_os = "windows"))]
    {
        let file = std::fs::File::open(path)?;
        file.sync_all()?;
    }

    Ok(())
}

const VOLUMES_FOLDER: &str = "volumes";
const SEGMENTS_FOLDER: &str = "segments";
const SEGMENT_LIST_FILE: &str = "segments";
const VOLUME_INFO_FILE: &str = "info.json";
const LAYOUT_SUFFIX: &str = ".layout";

/// Directory-backed segment store.
///
/// Layout under the root:
///
/// ```text
/// segments/segment.<ULID>           segment blobs (+ .layout sidecars)
/// volumes/<name>/segments           raw 16-byte ULIDs, concatenated
/// volumes/<name>/info.json          volume metadata
/// ```
pub struct FsVolume {
    root: PathBuf,
}

impl FsVolume {
    /// Opens (and if needed creates) a store rooted at `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> crate::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(SEGMENTS_FOLDER))?;
        std::fs::create_dir_all(root.join(VOLUMES_FOLDER))?;
        Ok(Self { root })
    }

    fn volume_dir(&self, name: &str) -> PathBuf {
        self.root.join(VOLUMES_FOLDER).join(name)
    }

    fn segment_path(&self, id: SegmentId) -> PathBuf {
        self.root.join(SEGMENTS_FOLDER).join(file_name(id))
    }

    fn layout_path(&self, id: SegmentId) -> PathBuf {
        self.root
            .join(SEGMENTS_FOLDER)
            .join(format!("{SEGMENT_FILE_PREFIX}{id}{LAYOUT_SUFFIX}"))
    }

    fn read_list(&self, volume: &str) -> crate::Result<Vec<SegmentId>> {
        let path = self.volume_dir(volume).join(SEGMENT_LIST_FILE);

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(crate::Error::VolumeNotFound(volume.into()));
            }
            Err(e) => return Err(e.into()),
        };

        if bytes.len() % SegmentId::LEN != 0 {
            return Err(crate::Error::Decode(
                crate::coding::DecodeError::InvalidHeader("SegmentList"),
            ));
        }

        Ok(bytes
            .chunks_exact(SegmentId::LEN)
            .map(|chunk| SegmentId::from_bytes(chunk.try_into().expect("16 bytes")))
            .collect())
    }

    fn write_list(&self, volume: &str, ids: &[SegmentId]) -> crate::Result<()> {
        let mut bytes = Vec::with_capacity(ids.len() * SegmentId::LEN);
        for id in ids {
            bytes.extend_from_slice(&id.to_bytes());
        }

        rewrite_atomic(self.volume_dir(volume).join(SEGMENT_LIST_FILE), &bytes)?;
        Ok(())
    }

    /// Reads a segment's layout sidecar, if present.
    pub fn read_layout(&self, id: SegmentId) -> crate::Result<Option<Vec<ExtentHeader>>> {
        let bytes = match std::fs::read(self.layout_path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let layout: Vec<ExtentHeader> = ciborium::from_reader(&bytes[..]).map_err(|e| {
            log::error!("cannot parse layout sidecar of segment {id}: {e}");
            crate::Error::Decode(crate::coding::DecodeError::InvalidHeader("SegmentLayout"))
        })?;

        Ok(Some(layout))
    }
}

impl SegmentAccess for FsVolume {
    fn init_volume(&self, info: &VolumeInfo) -> crate::Result<VolumeInfo> {
        info.validate()?;

        let dir = self.volume_dir(&info.name);
        let info_path = dir.join(VOLUME_INFO_FILE);

        if info_path.try_exists()? {
            return Err(crate::Error::Conflict(format!(
                "volume {:?} already exists",
                info.name,
            )));
        }

        std::fs::create_dir_all(&dir)?;
        rewrite_atomic(&info_path, &serde_json::to_vec_pretty(info)?)?;
        self.write_list(&info.name, &[])?;

        log::info!("created volume {:?} ({} bytes)", info.name, info.size);
        Ok(info.clone())
    }

    fn volume_info(&self, name: &str) -> crate::Result<VolumeInfo> {
        let path = self.volume_dir(name).join(VOLUME_INFO_FILE);

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(crate::Error::VolumeNotFound(name.into()));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_slice(&bytes)?)
    }

    fn list_segments(&self, volume: &str) -> crate::Result<Vec<SegmentId>> {
        self.read_list(volume)
    }

    fn open_segment(&self, _volume: &str, id: SegmentId) -> crate::Result<Box<dyn SegmentSource>> {
        let path = self.segment_path(id);

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(crate::Error::SegmentNotFound(id));
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();

        Ok(Box::new(FileSource {
            file: Mutex::new(file),
            len,
        }))
    }

    fn new_segment(
        &self,
        volume: &str,
        id: SegmentId,
        data: &[u8],
        layout: &[ExtentHeader],
    ) -> crate::Result<()> {
        // Blob first, then the sidecar, then the list; a crash in between
        // leaves an unreferenced blob that a later pack cleans up
        rewrite_atomic(self.segment_path(id), data)?;

        if !layout.is_empty() {
            let mut sidecar = Vec::new();
            ciborium::into_writer(layout, &mut sidecar).map_err(|e| {
                log::error!("cannot encode layout sidecar of segment {id}: {e}");
                crate::Error::Encode(crate::coding::EncodeError::Io(std::io::Error::other(
                    "cbor encode",
                )))
            })?;
            rewrite_atomic(self.layout_path(id), &sidecar)?;
        }

        let mut ids = self.read_list(volume)?;
        if !ids.contains(&id) {
            ids.push(id);
            self.write_list(volume, &ids)?;
        }

        log::debug!("stored segment {id} ({} bytes) in {volume:?}", data.len());
        Ok(())
    }

    fn remove_segment(&self, volume: &str, id: SegmentId) -> crate::Result<()> {
        let mut ids = self.read_list(volume)?;
        ids.retain(|x| *x != id);
        self.write_list(volume, &ids)?;

        for path in [self.segment_path(id), self.layout_path(id)] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }

        log::debug!("removed segment {id} from {volume:?}");
        Ok(())
    }
}

/// Opens a plain file as a [`SegmentSource`] (local segment cache).
pub(crate) fn open_file_source(path: &Path) -> crate::Result<Box<dyn SegmentSource>> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();

    Ok(Box::new(FileSource {
        file: Mutex::new(file),
        len,
    }))
}

struct FileSource {
    file: Mutex<File>,
    len: u64,
}

impl SegmentSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        let mut file = self.file.lock().expect("lock is poisoned");
        file.seek(std::io::SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }
}

impl From<serde_json::Error> for crate::Error {
    fn from(value: serde_json::Error) -> Self {
        log::error!("JSON error: {value}");
        Self::Decode(crate::coding::DecodeError::InvalidHeader("Json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{DeterministicGenerator, SequenceGenerator};
    use test_log::test;

    #[test]
    fn volume_lifecycle() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsVolume::new(dir.path())?;

        let info = VolumeInfo::new("vol0").size(MIN_VOLUME_SIZE);
        store.init_volume(&info)?;

        assert_eq!(info, store.volume_info("vol0")?);
        assert!(store.list_segments("vol0")?.is_empty());

        assert!(matches!(
            store.init_volume(&info),
            Err(crate::Error::Conflict(_)),
        ));
        assert!(matches!(
            store.volume_info("nope"),
            Err(crate::Error::VolumeNotFound(_)),
        ));

        Ok(())
    }

    #[test]
    fn undersized_volume_is_rejected() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsVolume::new(dir.path())?;

        let info = VolumeInfo::new("tiny").size(MIN_VOLUME_SIZE - 1);
        assert!(matches!(
            store.init_volume(&info),
            Err(crate::Error::Conflict(_)),
        ));

        Ok(())
    }

    #[test]
    fn segment_lifecycle() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsVolume::new(dir.path())?;
        store.init_volume(&VolumeInfo::new("vol0"))?;

        let gen = DeterministicGenerator::new(1);
        let a = gen.next();
        let b = gen.next();

        store.new_segment("vol0", a, b"aaaa", &[])?;
        store.new_segment("vol0", b, b"bbbbbb", &[])?;
        assert_eq!(vec![a, b], store.list_segments("vol0")?);

        let source = store.open_segment("vol0", a)?;
        assert_eq!(4, source.len());
        let mut buf = [0u8; 2];
        source.read_at(&mut buf, 1)?;
        assert_eq!(b"aa", &buf);

        store.remove_segment("vol0", a)?;
        assert_eq!(vec![b], store.list_segments("vol0")?);
        assert!(matches!(
            store.open_segment("vol0", a),
            Err(crate::Error::SegmentNotFound(_)),
        ));

        Ok(())
    }

    #[test]
    fn layout_sidecar_round_trips() -> crate::Result<()> {
        use crate::block::{Extent, BLOCK_SIZE};

        let dir = tempfile::tempdir()?;
        let store = FsVolume::new(dir.path())?;
        store.init_volume(&VolumeInfo::new("vol0"))?;

        let id = DeterministicGenerator::new(2).next();
        let layout = vec![ExtentHeader {
            extent: Extent::new(0, 1),
            offset: 0,
            compressed_size: 0,
            raw_size: BLOCK_SIZE as u32,
        }];

        store.new_segment("vol0", id, b"data", &layout)?;
        assert_eq!(Some(layout), store.read_layout(id)?);

        Ok(())
    }
}
