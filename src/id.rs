// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use ulid::Ulid;

/// Identifier of an immutable segment blob.
///
/// The byte-compare order of two IDs is their time-of-creation order,
/// so an ordered ID list doubles as the segment history.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SegmentId(Ulid);

impl SegmentId {
    /// Length of the raw representation in bytes
    pub const LEN: usize = 16;

    #[must_use]
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Raw big-endian bytes, suitable for byte-compare ordering.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        self.0 .0.to_be_bytes()
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(Ulid(u128::from_be_bytes(bytes)))
    }

    /// Parses the canonical base32 form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|_| crate::Error::Decode(crate::coding::DecodeError::InvalidHeader("Ulid")))
    }

    /// Milliseconds since the Unix epoch embedded in the ID.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for SegmentId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for SegmentId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Hands out segment IDs in strictly ascending order.
pub trait SequenceGenerator: Send + Sync {
    /// Mints the next segment ID.
    fn next(&self) -> SegmentId;
}

/// Wall-clock generator; IDs within the same millisecond differ in entropy.
pub struct ClockGenerator(Mutex<ulid::Generator>);

impl Default for ClockGenerator {
    fn default() -> Self {
        Self(Mutex::new(ulid::Generator::new()))
    }
}

impl SequenceGenerator for ClockGenerator {
    fn next(&self) -> SegmentId {
        let mut gen = self.0.lock().expect("lock is poisoned");

        loop {
            // Only fails when the entropy within one millisecond is
            // exhausted, which a beat later resolves itself
            if let Ok(ulid) = gen.generate() {
                return SegmentId(ulid);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

/// Deterministic generator for tests; a given seed reproduces the
/// exact same ID sequence (and thus segment filenames).
#[derive(Clone)]
pub struct DeterministicGenerator {
    seed: u64,
    counter: Arc<AtomicU64>,
}

impl DeterministicGenerator {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl SequenceGenerator for DeterministicGenerator {
    fn next(&self) -> SegmentId {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let entropy = xxhash_rust::xxh3::xxh3_128(&[self.seed.to_be_bytes(), n.to_be_bytes()].concat());

        // Counter as the timestamp keeps byte order == mint order
        SegmentId(Ulid::from_parts(n, entropy))
    }
}
