use super::encode_headers;
use crate::{
    block::Extent, compression::compress_frame, extent_map::ExtentHeader, id::SegmentId,
};
use byteorder::{BigEndian, WriteBytesExt};

/// Builds the binary form of one segment in memory.
///
/// Frames are laid out in append order; `finish` produces the
/// self-describing file (count, header block, payload region).
pub struct SegmentBuilder {
    id: SegmentId,
    headers: Vec<ExtentHeader>,
    payload: Vec<u8>,
}

impl SegmentBuilder {
    #[must_use]
    pub fn new(id: SegmentId) -> Self {
        Self {
            id,
            headers: Vec::new(),
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Compresses and appends one extent frame.
    ///
    /// # Panics
    ///
    /// Panics if the byte length does not match the extent.
    pub fn push(&mut self, extent: Extent, raw: &[u8]) -> ExtentHeader {
        assert_eq!(extent.byte_len(), raw.len(), "frame length mismatch");

        let stored = compress_frame(raw);

        // NOTE: Truncation is fine, raw frames are bounded by u32 sizes
        #[allow(clippy::cast_possible_truncation)]
        self.push_stored(extent, &stored, raw.len() as u32)
    }

    /// Appends an already-encoded frame payload (spill replay, reconciler).
    pub fn push_stored(&mut self, extent: Extent, stored: &[u8], raw_size: u32) -> ExtentHeader {
        // NOTE: Truncation is fine, stored is never larger than raw
        #[allow(clippy::cast_possible_truncation)]
        let header = ExtentHeader {
            extent,
            offset: self.payload.len() as u64,
            compressed_size: stored.len() as u32,
            raw_size,
        };

        self.payload.extend_from_slice(stored);
        self.headers.push(header);
        header
    }

    #[must_use]
    pub fn headers(&self) -> &[ExtentHeader] {
        &self.headers
    }

    #[must_use]
    pub fn extent_count(&self) -> usize {
        self.headers.len()
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.headers.iter().map(|h| u64::from(h.extent.blocks)).sum()
    }

    /// Bytes buffered so far (payload only).
    #[must_use]
    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Produces the complete segment file bytes plus the header list.
    #[must_use]
    pub fn finish(self) -> (Vec<ExtentHeader>, Vec<u8>) {
        let file = encode_segment_file(&self.headers, &[&self.payload]);
        (self.headers, file)
    }
}

/// Assembles a segment file from a header list and payload chunks.
pub(crate) fn encode_segment_file(headers: &[ExtentHeader], payload_chunks: &[&[u8]]) -> Vec<u8> {
    let header_block = encode_headers(headers);
    let payload_len: usize = payload_chunks.iter().map(|c| c.len()).sum();

    let mut file = Vec::with_capacity(8 + header_block.len() + payload_len);

    // NOTE: Truncation is fine, counts and header blocks are u32-bounded
    #[allow(clippy::cast_possible_truncation)]
    {
        file.write_u32::<BigEndian>(headers.len() as u32)
            .expect("vec write");
        file.write_u32::<BigEndian>(header_block.len() as u32)
            .expect("vec write");
    }

    file.extend_from_slice(&header_block);
    for chunk in payload_chunks {
        file.extend_from_slice(chunk);
    }

    file
}
