// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    extent_map::ExtentHeader,
    id::SegmentId,
    volume::{SegmentAccess, SegmentSource, VolumeInfo},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, RwLock,
    },
};

/// In-memory segment blob
#[allow(clippy::module_name_repetitions)]
pub struct MemSource {
    data: Arc<Vec<u8>>,
    md5: Option<Vec<u8>>,
}

impl MemSource {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            md5: None,
        }
    }
}

impl SegmentSource for MemSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        let start = usize::try_from(offset).expect("offset fits usize");
        let end = start + buf.len();

        let slice = self.data.get(start..end).ok_or_else(|| {
            crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of blob",
            ))
        })?;

        buf.copy_from_slice(slice);
        Ok(())
    }

    fn content_md5(&self) -> Option<Vec<u8>> {
        self.md5.clone()
    }
}

#[derive(Default)]
struct MemVolumeInner {
    volumes: HashMap<String, VolumeInfo>,
    lists: HashMap<String, Vec<SegmentId>>,
    segments: HashMap<SegmentId, (Arc<Vec<u8>>, Vec<ExtentHeader>)>,
}

/// In-memory segment store for tests.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Default)]
pub struct MemVolume {
    inner: Arc<RwLock<MemVolumeInner>>,

    /// When set, writes fail with a transient error (replica outage tests)
    fail_writes: Arc<AtomicBool>,
}

impl MemVolume {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent writes fail, simulating an unreachable store.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Drops a segment blob without touching the volume list (corruption tests).
    pub fn drop_blob(&self, id: SegmentId) {
        self.inner
            .write()
            .expect("lock is poisoned")
            .segments
            .remove(&id);
    }

    /// The stored layout sidecar of a segment.
    #[must_use]
    pub fn layout(&self, id: SegmentId) -> Option<Vec<ExtentHeader>> {
        self.inner
            .read()
            .expect("lock is poisoned")
            .segments
            .get(&id)
            .map(|(_, layout)| layout.clone())
    }

    fn check_writable(&self) -> crate::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(crate::Error::Transient("store unreachable".into()));
        }
        Ok(())
    }
}

impl SegmentAccess for MemVolume {
    fn init_volume(&self, info: &VolumeInfo) -> crate::Result<VolumeInfo> {
        self.check_writable()?;
        info.validate()?;

        let mut inner = self.inner.write().expect("lock is poisoned");

        if inner.volumes.contains_key(&info.name) {
            return Err(crate::Error::Conflict(format!(
                "volume {:?} already exists",
                info.name,
            )));
        }

        inner.volumes.insert(info.name.clone(), info.clone());
        inner.lists.insert(info.name.clone(), Vec::new());
        Ok(info.clone())
    }

    fn volume_info(&self, name: &str) -> crate::Result<VolumeInfo> {
        self.inner
            .read()
            .expect("lock is poisoned")
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| crate::Error::VolumeNotFound(name.into()))
    }

    fn list_segments(&self, volume: &str) -> crate::Result<Vec<SegmentId>> {
        self.inner
            .read()
            .expect("lock is poisoned")
            .lists
            .get(volume)
            .cloned()
            .ok_or_else(|| crate::Error::VolumeNotFound(volume.into()))
    }

    fn open_segment(&self, _volume: &str, id: SegmentId) -> crate::Result<Box<dyn SegmentSource>> {
        let inner = self.inner.read().expect("lock is poisoned");

        let (data, _) = inner
            .segments
            .get(&id)
            .ok_or(crate::Error::SegmentNotFound(id))?;

        Ok(Box::new(MemSource {
            data: data.clone(),
            md5: None,
        }))
    }

    fn new_segment(
        &self,
        volume: &str,
        id: SegmentId,
        data: &[u8],
        layout: &[ExtentHeader],
    ) -> crate::Result<()> {
        self.check_writable()?;

        let mut inner = self.inner.write().expect("lock is poisoned");

        let list = inner
            .lists
            .get_mut(volume)
            .ok_or_else(|| crate::Error::VolumeNotFound(volume.into()))?;

        if !list.contains(&id) {
            list.push(id);
        }
        inner
            .segments
            .insert(id, (Arc::new(data.to_vec()), layout.to_vec()));

        Ok(())
    }

    fn remove_segment(&self, volume: &str, id: SegmentId) -> crate::Result<()> {
        self.check_writable()?;

        let mut inner = self.inner.write().expect("lock is poisoned");

        let list = inner
            .lists
            .get_mut(volume)
            .ok_or_else(|| crate::Error::VolumeNotFound(volume.into()))?;

        list.retain(|x| *x != id);
        inner.segments.remove(&id);
        Ok(())
    }
}

struct Gate {
    open: bool,
    waiting: usize,
}

/// Wraps a store, holding every `new_segment` until the latch is opened.
///
/// Lets tests freeze an in-flight segment upload to observe the
/// previous-cache hand-off window.
pub struct LatchVolume<A> {
    inner: A,
    gate: Arc<(Mutex<Gate>, Condvar)>,
}

impl<A: SegmentAccess> LatchVolume<A> {
    #[must_use]
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            gate: Arc::new((
                Mutex::new(Gate {
                    open: true,
                    waiting: 0,
                }),
                Condvar::new(),
            )),
        }
    }

    /// A handle that opens/closes the latch from another thread.
    #[must_use]
    pub fn latch(&self) -> LatchHandle {
        LatchHandle(self.gate.clone())
    }
}

/// Remote control for a [`LatchVolume`]'s gate.
#[derive(Clone)]
pub struct LatchHandle(Arc<(Mutex<Gate>, Condvar)>);

impl LatchHandle {
    /// Blocks uploads until [`Self::open`] is called.
    pub fn close(&self) {
        self.0 .0.lock().expect("lock is poisoned").open = false;
        self.0 .1.notify_all();
    }

    pub fn open(&self) {
        self.0 .0.lock().expect("lock is poisoned").open = true;
        self.0 .1.notify_all();
    }

    /// How many uploads are currently parked on the closed latch.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.0 .0.lock().expect("lock is poisoned").waiting
    }
}

impl<A: SegmentAccess> SegmentAccess for LatchVolume<A> {
    fn init_volume(&self, info: &VolumeInfo) -> crate::Result<VolumeInfo> {
        self.inner.init_volume(info)
    }

    fn volume_info(&self, name: &str) -> crate::Result<VolumeInfo> {
        self.inner.volume_info(name)
    }

    fn list_segments(&self, volume: &str) -> crate::Result<Vec<SegmentId>> {
        self.inner.list_segments(volume)
    }

    fn open_segment(&self, volume: &str, id: SegmentId) -> crate::Result<Box<dyn SegmentSource>> {
        self.inner.open_segment(volume, id)
    }

    fn new_segment(
        &self,
        volume: &str,
        id: SegmentId,
        data: &[u8],
        layout: &[ExtentHeader],
    ) -> crate::Result<()> {
        let (lock, cvar) = &*self.gate;
        let mut gate = lock.lock().expect("lock is poisoned");
        while !gate.open {
            gate.waiting += 1;
            gate = cvar.wait(gate).expect("lock is poisoned");
            gate.waiting -= 1;
        }
        drop(gate);

        self.inner.new_segment(volume, id, data, layout)
    }

    fn remove_segment(&self, volume: &str, id: SegmentId) -> crate::Result<()> {
        self.inner.remove_segment(volume, id)
    }
}
