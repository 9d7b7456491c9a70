// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    id::SegmentId,
    version::Version,
};

/// Represents errors that can occur in the virtual disk
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Segment does not exist in the store
    SegmentNotFound(SegmentId),

    /// Volume does not exist in the store
    VolumeNotFound(String),

    /// Volume already exists, or primary and replica disagree about it
    Conflict(String),

    /// Invalid data format version
    InvalidVersion(Option<Version>),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Checksum check failed
    ChecksumMismatch,

    /// Compression failed
    Compress,

    /// Decompression failed
    Decompress,

    /// Network timeout, expired URL or 5xx response
    Transient(String),

    /// Remote store returned a terminal error status
    Remote(u16, String),

    /// Operation was cancelled by the caller
    Cancelled,

    /// Invariant violation, the disk must not be used anymore
    Fatal(String),

    /// Request was not aligned to the block size
    Unaligned,
}

impl Error {
    /// Whether a retry (possibly after a URL refresh) may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the entity was simply absent, allowing replica fallback.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SegmentNotFound(_) | Self::VolumeNotFound(_))
            || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Maps the error onto the errno the block device surface reports.
    #[must_use]
    pub fn errno(&self) -> i32 {
        // EINVAL for malformed requests, EIO for everything else
        match self {
            Self::Unaligned => 22,
            _ => 5,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LsvdError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Disk result
pub type Result<T> = std::result::Result<T, Error>;
