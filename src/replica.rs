// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cancel::Cancel,
    extent_map::ExtentHeader,
    id::SegmentId,
    segment::parse_file,
    volume::{SegmentAccess, SegmentSource, VolumeInfo},
};
use md5::Digest;
use std::{collections::HashSet, sync::Arc, time::Duration};

/// Copy chunk size of the reconciler (1 MiB)
const COPY_CHUNK: u64 = 1_024 * 1_024;

/// Write-through pair of segment stores.
///
/// The primary is authoritative: writes go there first and only then to
/// the replica, whose failures are logged but never fail the operation.
/// Reads fall back to the replica when the primary lost a segment, and
/// segment listings are merged from both histories.
pub struct TeeVolume {
    primary: Arc<dyn SegmentAccess>,
    replica: Arc<dyn SegmentAccess>,
}

impl TeeVolume {
    #[must_use]
    pub fn new(primary: Arc<dyn SegmentAccess>, replica: Arc<dyn SegmentAccess>) -> Self {
        Self { primary, replica }
    }
}

impl SegmentAccess for TeeVolume {
    fn init_volume(&self, info: &VolumeInfo) -> crate::Result<VolumeInfo> {
        let created = self.primary.init_volume(info)?;

        if let Err(e) = self.replica.init_volume(&created) {
            log::warn!("replica init_volume({:?}) failed: {e}", info.name);
        }

        Ok(created)
    }

    fn volume_info(&self, name: &str) -> crate::Result<VolumeInfo> {
        let info = self.primary.volume_info(name)?;

        match self.replica.volume_info(name) {
            Ok(replica_info) => {
                if replica_info.uuid != info.uuid || replica_info.size != info.size {
                    return Err(crate::Error::Conflict(format!(
                        "volume {name:?} differs between primary and replica",
                    )));
                }
            }
            Err(e) if e.is_not_found() => {
                // Reconciliation will backfill the replica
            }
            Err(e) => log::warn!("replica volume_info({name:?}) failed: {e}"),
        }

        Ok(info)
    }

    fn list_segments(&self, volume: &str) -> crate::Result<Vec<SegmentId>> {
        match (
            self.primary.list_segments(volume),
            self.replica.list_segments(volume),
        ) {
            (Ok(p), Ok(r)) => Ok(compose_segment_list(&p, &r)),
            (Ok(p), Err(e)) => {
                log::warn!("replica list_segments({volume:?}) failed: {e}");
                Ok(p)
            }
            (Err(e), Ok(r)) => {
                log::warn!("primary list_segments({volume:?}) failed: {e}");
                Ok(r)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    fn open_segment(&self, volume: &str, id: SegmentId) -> crate::Result<Box<dyn SegmentSource>> {
        match self.primary.open_segment(volume, id) {
            Err(e) if e.is_not_found() => {
                log::debug!("segment {id} not on primary, trying replica");
                self.replica.open_segment(volume, id)
            }
            other => other,
        }
    }

    fn new_segment(
        &self,
        volume: &str,
        id: SegmentId,
        data: &[u8],
        layout: &[ExtentHeader],
    ) -> crate::Result<()> {
        self.primary.new_segment(volume, id, data, layout)?;

        if let Err(e) = self.replica.new_segment(volume, id, data, layout) {
            log::warn!("replica new_segment({id}) failed: {e}");
        }

        Ok(())
    }

    fn remove_segment(&self, volume: &str, id: SegmentId) -> crate::Result<()> {
        self.primary.remove_segment(volume, id)?;

        if let Err(e) = self.replica.remove_segment(volume, id) {
            if !e.is_not_found() {
                log::warn!("replica remove_segment({id}) failed: {e}");
            }
        }

        Ok(())
    }
}

fn sort_dedup(mut ids: Vec<SegmentId>) -> Vec<SegmentId> {
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Merges two divergent segment histories.
///
/// Handles the common shapes cheaply (one side empty, one side a suffix
/// of the other, replica tail overlapping the primary head) and falls
/// back to a time-ordered merge. The result is strictly ascending in
/// ULID order and free of duplicates.
#[must_use]
pub fn compose_segment_list(primary: &[SegmentId], replica: &[SegmentId]) -> Vec<SegmentId> {
    if primary.is_empty() {
        return sort_dedup(replica.to_vec());
    }
    if replica.is_empty() {
        return sort_dedup(primary.to_vec());
    }

    if replica.ends_with(primary) {
        return sort_dedup(replica.to_vec());
    }
    if primary.ends_with(replica) {
        return sort_dedup(primary.to_vec());
    }

    // Largest overlap where a tail of the replica equals a head of the primary
    let max = replica.len().min(primary.len());
    for k in (1..=max).rev() {
        if replica[replica.len() - k..] == primary[..k] {
            let mut out = replica[..replica.len() - k].to_vec();
            out.extend_from_slice(primary);
            return sort_dedup(out);
        }
    }

    let mut out = replica.to_vec();
    out.extend_from_slice(primary);
    sort_dedup(out)
}

/// Background backfill of segments the replica is missing.
pub struct Reconciler {
    primary: Arc<dyn SegmentAccess>,
    replica: Arc<dyn SegmentAccess>,
    volume: String,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        primary: Arc<dyn SegmentAccess>,
        replica: Arc<dyn SegmentAccess>,
        volume: &str,
    ) -> Self {
        Self {
            primary,
            replica,
            volume: volume.into(),
        }
    }

    /// One reconciliation sweep; returns how many segments were copied.
    pub fn run_once(&self, cancel: &Cancel) -> crate::Result<usize> {
        let info = self.primary.volume_info(&self.volume)?;

        match self.replica.volume_info(&self.volume) {
            Ok(replica_info) => {
                if replica_info.uuid != info.uuid {
                    return Err(crate::Error::Conflict(format!(
                        "volume {:?} differs between primary and replica",
                        self.volume,
                    )));
                }
            }
            Err(e) if e.is_not_found() => {
                self.replica.init_volume(&info)?;
            }
            Err(e) => return Err(e),
        }

        let on_primary = self.primary.list_segments(&self.volume)?;
        let on_replica: HashSet<SegmentId> =
            self.replica.list_segments(&self.volume)?.into_iter().collect();

        let mut copied = 0;

        for id in on_primary {
            if on_replica.contains(&id) {
                continue;
            }

            cancel.check()?;
            self.copy_segment(id)?;
            copied += 1;
        }

        if copied > 0 {
            log::info!("reconciled {copied} segments of {:?} to replica", self.volume);
        }

        Ok(copied)
    }

    fn copy_segment(&self, id: SegmentId) -> crate::Result<()> {
        let source = self.primary.open_segment(&self.volume, id)?;
        let len = source.len();

        let mut data = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
        let mut offset = 0u64;

        while offset < len {
            let chunk = COPY_CHUNK.min(len - offset) as usize;
            let mut buf = vec![0u8; chunk];
            source.read_at(&mut buf, offset)?;
            data.extend_from_slice(&buf);
            offset += chunk as u64;
        }

        if let Some(expected) = source.content_md5() {
            let digest = md5::Md5::digest(&data);
            if digest.as_slice() != expected.as_slice() {
                return Err(crate::Error::ChecksumMismatch);
            }
        }

        // Re-derive the layout sidecar from the blob itself
        let (layout, _) = parse_file(&data)?;

        self.replica.new_segment(&self.volume, id, &data, &layout)?;
        log::debug!("copied segment {id} ({len} bytes) to replica");

        Ok(())
    }

    /// Runs sweeps on an interval until cancelled.
    pub fn spawn(self, interval: Duration, cancel: Cancel) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let tick = Duration::from_millis(100);

            loop {
                match self.run_once(&cancel) {
                    Ok(_) => {}
                    Err(crate::Error::Cancelled) => return,
                    Err(e) => log::warn!("reconciliation of {:?} failed: {e}", self.volume),
                }

                let mut slept = Duration::ZERO;
                while slept < interval {
                    if cancel.is_cancelled() {
                        return;
                    }
                    std::thread::sleep(tick);
                    slept += tick;
                }
            }
        })
    }
}
