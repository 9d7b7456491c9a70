// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod reader;
pub mod writer;

use crate::{
    block::Extent,
    coding::{read_uvarint, write_uvarint, DecodeError},
    extent_map::ExtentHeader,
    id::SegmentId,
};

/// Filename prefix of locally stored segment blobs
pub const SEGMENT_FILE_PREFIX: &str = "segment.";

/// A segment file is self-describing:
///
/// ```text
/// count: u32 BE | hdr_len: u32 BE | headers (hdr_len bytes) | payload
/// ```
///
/// Each header is five densely packed uvarints (`lba`, `blocks`,
/// `compressed_size`, `offset`, `raw_size`); the payload region starts at
/// byte `8 + hdr_len`, and frame `i` occupies
/// `[offset_i, offset_i + compressed_size_i)` within it.
pub(crate) const FIXED_HEADER_LEN: u64 = 8;

#[must_use]
pub(crate) fn file_name(id: SegmentId) -> String {
    format!("{SEGMENT_FILE_PREFIX}{id}")
}

/// Serializes the extent header block.
pub(crate) fn encode_headers(headers: &[ExtentHeader]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(headers.len() * 12);

    for h in headers {
        // Writing into a Vec cannot fail
        write_uvarint(&mut buf, h.extent.lba).expect("vec write");
        write_uvarint(&mut buf, u64::from(h.extent.blocks)).expect("vec write");
        write_uvarint(&mut buf, u64::from(h.compressed_size)).expect("vec write");
        write_uvarint(&mut buf, h.offset).expect("vec write");
        write_uvarint(&mut buf, u64::from(h.raw_size)).expect("vec write");
    }

    buf
}

/// Parses `count` extent headers; the slice must span exactly the header block.
pub(crate) fn decode_headers(bytes: &[u8], count: usize) -> Result<Vec<ExtentHeader>, DecodeError> {
    let mut cursor = bytes;
    let mut headers = Vec::with_capacity(count);

    for _ in 0..count {
        let lba = read_uvarint(&mut cursor)?;
        let blocks = read_uvarint(&mut cursor)?;
        let compressed_size = read_uvarint(&mut cursor)?;
        let offset = read_uvarint(&mut cursor)?;
        let raw_size = read_uvarint(&mut cursor)?;

        let blocks =
            u32::try_from(blocks).map_err(|_| DecodeError::InvalidHeader("ExtentHeader"))?;
        if blocks == 0 {
            return Err(DecodeError::InvalidHeader("ExtentHeader"));
        }

        headers.push(ExtentHeader {
            extent: Extent { lba, blocks },
            offset,
            compressed_size: u32::try_from(compressed_size)
                .map_err(|_| DecodeError::InvalidHeader("ExtentHeader"))?,
            raw_size: u32::try_from(raw_size)
                .map_err(|_| DecodeError::InvalidHeader("ExtentHeader"))?,
        });
    }

    if !cursor.is_empty() {
        return Err(DecodeError::InvalidHeader("ExtentHeader"));
    }

    Ok(headers)
}

/// Splits a complete in-memory segment file into headers and payload.
pub(crate) fn parse_file(bytes: &[u8]) -> Result<(Vec<ExtentHeader>, &[u8]), DecodeError> {
    let fixed = bytes
        .get(..FIXED_HEADER_LEN as usize)
        .ok_or(DecodeError::InvalidHeader("Segment"))?;

    let count = u32::from_be_bytes(fixed[0..4].try_into().expect("4 bytes"));
    let hdr_len = u32::from_be_bytes(fixed[4..8].try_into().expect("4 bytes"));

    let hdr_end = FIXED_HEADER_LEN as usize + hdr_len as usize;
    let header_block = bytes
        .get(FIXED_HEADER_LEN as usize..hdr_end)
        .ok_or(DecodeError::InvalidHeader("Segment"))?;

    let headers = decode_headers(header_block, count as usize)?;
    let payload = bytes.get(hdr_end..).unwrap_or(&[]);

    Ok((headers, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_SIZE;
    use test_log::test;

    #[test]
    fn headers_round_trip() {
        let headers = vec![
            ExtentHeader {
                extent: Extent::new(0, 1),
                offset: 0,
                compressed_size: 0,
                raw_size: BLOCK_SIZE as u32,
            },
            ExtentHeader {
                extent: Extent::new(1_000_000, 47),
                offset: 123_456,
                compressed_size: 999,
                raw_size: 47 * BLOCK_SIZE as u32,
            },
        ];

        let bytes = encode_headers(&headers);
        let parsed = decode_headers(&bytes, headers.len()).expect("should parse");
        assert_eq!(headers, parsed);
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let headers = vec![ExtentHeader {
            extent: Extent::new(0, 1),
            offset: 0,
            compressed_size: 10,
            raw_size: BLOCK_SIZE as u32,
        }];

        let mut bytes = encode_headers(&headers);
        bytes.push(0);

        assert!(decode_headers(&bytes, 1).is_err());
    }

    #[test]
    fn empty_block_count_is_rejected() {
        let bytes = encode_headers(&[ExtentHeader {
            extent: Extent { lba: 0, blocks: 0 },
            offset: 0,
            compressed_size: 0,
            raw_size: 0,
        }]);

        assert!(decode_headers(&bytes, 1).is_err());
    }
}
