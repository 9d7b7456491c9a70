// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{decode_headers, FIXED_HEADER_LEN};
use crate::{
    coding::DecodeError,
    compression::decompress_frame,
    extent_map::{ExtentHeader, PartialExtent},
    id::SegmentId,
    volume::SegmentSource,
};

/// Random-access reader over one segment blob.
///
/// The header block is parsed once on open; frame reads then translate
/// into ranged reads against the underlying source (local file or
/// presigned remote URL).
pub struct SegmentReader {
    id: SegmentId,
    source: Box<dyn SegmentSource>,
    layout: Vec<ExtentHeader>,
    payload_base: u64,
}

impl SegmentReader {
    /// Opens a segment, parsing its header block.
    pub fn open(id: SegmentId, source: Box<dyn SegmentSource>) -> crate::Result<Self> {
        let mut fixed = [0u8; FIXED_HEADER_LEN as usize];
        source.read_at(&mut fixed, 0)?;

        let count = u32::from_be_bytes(fixed[0..4].try_into().expect("4 bytes"));
        let hdr_len = u32::from_be_bytes(fixed[4..8].try_into().expect("4 bytes"));

        if FIXED_HEADER_LEN + u64::from(hdr_len) > source.len() {
            return Err(crate::Error::Decode(DecodeError::InvalidHeader("Segment")));
        }

        let mut header_block = vec![0u8; hdr_len as usize];
        source.read_at(&mut header_block, FIXED_HEADER_LEN)?;

        let layout = decode_headers(&header_block, count as usize)?;

        Ok(Self {
            id,
            source,
            layout,
            payload_base: FIXED_HEADER_LEN + u64::from(hdr_len),
        })
    }

    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// The parsed extent headers, in frame order.
    #[must_use]
    pub fn layout(&self) -> &[ExtentHeader] {
        &self.layout
    }

    /// Raw blob range read; `file_offset` is relative to the whole file.
    pub fn read_at(&self, buf: &mut [u8], file_offset: u64) -> crate::Result<()> {
        self.source.read_at(buf, file_offset)
    }

    /// Reads and decompresses one whole frame.
    pub fn read_frame(&self, header: &ExtentHeader) -> crate::Result<Vec<u8>> {
        if header.is_zero() {
            return Ok(vec![0; header.raw_size as usize]);
        }

        let mut stored = vec![0u8; header.compressed_size as usize];
        self.read_at(&mut stored, self.payload_base + header.offset)?;

        decompress_frame(&stored, header.raw_size as usize)
    }

    /// Reads the live subrange of a piece.
    ///
    /// Zero frames are synthesized without I/O and verbatim frames are
    /// read partially; only LZ4 frames need the whole payload.
    pub fn read_piece(&self, pe: &PartialExtent) -> crate::Result<Vec<u8>> {
        debug_assert_eq!(self.id, pe.loc.segment);

        let header = &pe.loc.header;
        let (start, end) = pe.raw_range();

        if header.is_zero() {
            return Ok(vec![0; end - start]);
        }

        if header.is_verbatim() {
            let mut buf = vec![0u8; end - start];
            self.read_at(&mut buf, self.payload_base + header.offset + start as u64)?;
            return Ok(buf);
        }

        let raw = self.read_frame(header)?;
        raw.get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| crate::Error::Decode(DecodeError::InvalidHeader("ExtentFrame")))
    }
}
