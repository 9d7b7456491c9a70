// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};

/// Error during serialization
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error
    Io(std::io::Error),
}

/// Error during deserialization
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// Varint did not terminate within 10 bytes
    VarintOverflow,

    /// Invalid block header
    InvalidHeader(&'static str),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncodeError({self:?})")
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DecodeError({self:?})")
    }
}

impl std::error::Error for EncodeError {}
impl std::error::Error for DecodeError {}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Trait to serialize stuff
pub trait Encode {
    /// Serializes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into vector.
    fn encode_into_vec(&self) -> Result<Vec<u8>, EncodeError> {
        let mut v = vec![];
        self.encode_into(&mut v)?;
        Ok(v)
    }
}

/// Trait to deserialize stuff
pub trait Decode {
    /// Deserializes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}

/// Writes an LEB128-encoded unsigned integer.
pub fn write_uvarint<W: Write>(writer: &mut W, mut n: u64) -> Result<(), EncodeError> {
    loop {
        let mut byte = (n & 0x7F) as u8;
        n >>= 7;

        if n != 0 {
            byte |= 0x80;
        }
        writer.write_all(&[byte])?;

        if n == 0 {
            return Ok(());
        }
    }
}

/// Reads an LEB128-encoded unsigned integer.
pub fn read_uvarint<R: Read>(reader: &mut R) -> Result<u64, DecodeError> {
    let mut n = 0u64;

    for shift in 0..10 {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;

        // The 10th byte may only carry the topmost bit of a u64
        if shift == 9 && byte[0] > 1 {
            return Err(DecodeError::VarintOverflow);
        }

        n |= u64::from(byte[0] & 0x7F) << (shift * 7);

        if byte[0] & 0x80 == 0 {
            return Ok(n);
        }
    }

    Err(DecodeError::VarintOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn uvarint_round_trip() {
        for n in [
            0u64,
            1,
            127,
            128,
            300,
            16_383,
            16_384,
            u64::from(u32::MAX),
            u64::MAX,
        ] {
            let mut buf = vec![];
            write_uvarint(&mut buf, n).expect("write into vec");

            let got = read_uvarint(&mut &buf[..]).expect("should decode");
            assert_eq!(n, got);
        }
    }

    #[test]
    fn uvarint_single_byte() {
        let mut buf = vec![];
        write_uvarint(&mut buf, 47).expect("write into vec");
        assert_eq!(buf, [47]);
    }

    #[test]
    fn uvarint_overflow() {
        let buf = [0xFF; 11];
        assert!(matches!(
            read_uvarint(&mut &buf[..]),
            Err(DecodeError::VarintOverflow)
        ));
    }

    #[test]
    fn uvarint_truncated() {
        let buf = [0x80];
        assert!(matches!(
            read_uvarint(&mut &buf[..]),
            Err(DecodeError::Io(_))
        ));
    }
}
