/// How a frame payload is stored on disk.
///
/// A frame whose bytes are all zero is encoded without any payload
/// (`compressed_size == 0`). A frame that does not shrink under LZ4 is
/// stored verbatim (`compressed_size == raw_size`). Everything else is an
/// LZ4 block of `compressed_size` bytes.
#[must_use]
pub fn compress_frame(raw: &[u8]) -> Vec<u8> {
    if is_all_zero(raw) {
        return Vec::new();
    }

    let compressed = lz4_flex::compress(raw);

    if compressed.len() >= raw.len() {
        raw.to_vec()
    } else {
        compressed
    }
}

/// Recovers the raw bytes of a frame payload.
pub fn decompress_frame(stored: &[u8], raw_size: usize) -> crate::Result<Vec<u8>> {
    if stored.is_empty() {
        return Ok(vec![0; raw_size]);
    }

    if stored.len() == raw_size {
        return Ok(stored.to_vec());
    }

    lz4_flex::decompress(stored, raw_size).map_err(|e| {
        log::error!("lz4 decompression failed: {e}");
        crate::Error::Decompress
    })
}

pub(crate) fn is_all_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}
