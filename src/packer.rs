// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    block::Extent,
    cancel::Cancel,
    disk::{Disk, DiskState},
    extent_map::{ExtentHeader, ExtentLocation, PartialExtent},
    id::SegmentId,
    segment::writer::SegmentBuilder,
};

/// Coalesce up to this many adjacent blocks into one frame
const COALESCE_BLOCKS: u32 = 100;

/// What a pack pass accomplished.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PackReport {
    pub segments_created: usize,
    pub segments_deleted: usize,
    pub extents_written: usize,
    pub blocks_moved: u64,
}

/// Rewrites every live extent into fresh, dense segments and deletes
/// segments without any remaining live blocks.
///
/// Holds the writer lock for the whole pass, so packing is atomic with
/// respect to writers; reads keep working off the old segments until the
/// map rewrite at the end. A failure before the rewrite leaves at most
/// some orphaned new segments behind, which the next pass collects.
pub(crate) fn run(disk: &Disk, cancel: &Cancel) -> crate::Result<PackReport> {
    let _guard = disk.rollover_guard.lock().expect("lock is poisoned");

    // Flush the write cache first so segment IDs keep following flush
    // order; a pack output minted while older writes still sat in the
    // cache would otherwise outrank them during rebuild
    disk.rollover_locked(true, cancel)?;

    let mut st = disk.state.write().expect("lock is poisoned");
    let mut report = PackReport::default();

    let pieces: Vec<PartialExtent> = st.map.iter().copied().collect();
    log::info!(
        "packing {} live pieces across {} segments",
        pieces.len(),
        st.segments.len(),
    );

    let mut new_locations: Vec<(SegmentId, ExtentHeader)> = Vec::new();
    let mut created: Vec<SegmentId> = Vec::new();

    if !pieces.is_empty() {
        let mut builder = SegmentBuilder::new(disk.config.seqgen.next());
        let mut pending: Option<(Extent, Vec<u8>)> = None;

        for pe in &pieces {
            cancel.check()?;

            let raw = read_piece(disk, pe)?;
            report.blocks_moved += u64::from(pe.live.blocks);

            match &mut pending {
                Some((extent, buf)) if extent.end() == pe.live.lba => {
                    extent.blocks += pe.live.blocks;
                    buf.extend_from_slice(&raw);
                }
                _ => {
                    flush_pending(&mut builder, &mut pending, &mut new_locations);
                    pending = Some((pe.live, raw));
                }
            }

            if pending
                .as_ref()
                .is_some_and(|(extent, _)| extent.blocks >= COALESCE_BLOCKS)
            {
                flush_pending(&mut builder, &mut pending, &mut new_locations);
            }

            if builder.payload_len() >= disk.config.flush_threshold {
                flush_pending(&mut builder, &mut pending, &mut new_locations);

                let next = SegmentBuilder::new(disk.config.seqgen.next());
                let full = std::mem::replace(&mut builder, next);
                finish_segment(disk, &mut st, full, &mut created, &mut report)?;
            }
        }

        flush_pending(&mut builder, &mut pending, &mut new_locations);

        if !builder.is_empty() {
            finish_segment(disk, &mut st, builder, &mut created, &mut report)?;
        }
    }

    report.extents_written = new_locations.len();

    // Point the map at the new segments; every displaced piece drains the
    // usage of whatever segment held it before
    for (segment, header) in &new_locations {
        let displaced = st.map.insert(PartialExtent {
            live: header.extent,
            loc: ExtentLocation {
                segment: *segment,
                header: *header,
                disk_index: 0,
            },
        });

        st.segments.add_used(*segment, header.extent.blocks);
        st.segments.apply_displaced(&displaced);
    }

    for id in &created {
        disk.write_usage_sidecar(&st, *id);
    }

    // Delete what no longer holds live data, sparing the active cache
    // and the most recently flushed segment
    let mut exclude = vec![st.wc.id()];
    if let Some(last) = st.last_flushed {
        exclude.push(last);
    }
    exclude.extend(created.iter().copied());

    for id in st.segments.dead(&exclude) {
        st.segments.mark_deleted(id);

        match disk.volume.remove_segment(&disk.layers[0], id) {
            Ok(()) => {
                st.segments.remove(id);
                disk.drop_reader(id);
                disk.remove_usage_sidecar(id);
                report.segments_deleted += 1;
            }
            Err(e) => {
                // Stays flagged; the next pass retries the delete
                log::warn!("cannot delete dead segment {id}: {e}");
            }
        }
    }

    log::info!(
        "pack done: {} new segments, {} extents, {} deleted",
        report.segments_created,
        report.extents_written,
        report.segments_deleted,
    );

    Ok(report)
}

fn read_piece(disk: &Disk, pe: &PartialExtent) -> crate::Result<Vec<u8>> {
    // The cache was flushed on entry, so every piece is durable (or in
    // a read-only lower layer)
    let reader = disk.reader(pe.loc.disk_index, pe.loc.segment)?;
    reader.read_piece(pe)
}

fn flush_pending(
    builder: &mut SegmentBuilder,
    pending: &mut Option<(Extent, Vec<u8>)>,
    new_locations: &mut Vec<(SegmentId, ExtentHeader)>,
) {
    if let Some((extent, buf)) = pending.take() {
        let header = builder.push(extent, &buf);
        new_locations.push((builder.id(), header));
    }
}

fn finish_segment(
    disk: &Disk,
    st: &mut DiskState,
    builder: SegmentBuilder,
    created: &mut Vec<SegmentId>,
    report: &mut PackReport,
) -> crate::Result<()> {
    let id = builder.id();
    let (headers, file) = builder.finish();

    disk.volume
        .new_segment(&disk.layers[0], id, &file, &headers)?;

    st.segments.track(id);
    for header in &headers {
        st.segments.add_frame(id, header.extent.blocks);
    }
    st.segments.mark_durable(id);

    disk.metrics.add_segment_written(file.len() as u64);
    created.push(id);
    report.segments_created += 1;

    log::debug!("packed segment {id} ({} frames, {} bytes)", headers.len(), file.len());
    Ok(())
}
