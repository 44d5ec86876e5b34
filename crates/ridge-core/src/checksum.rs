//! Chunk checksums.
//!
//! Every DATA payload travels with the BLAKE3 digest of its exact bytes.
//! Both peers compute it the same way over the bytes that end up on disk,
//! so a match means the chunk can be written as-is.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// BLAKE3 digest of a chunk payload. Serialized as 64 lowercase hex chars.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form used on the wire.
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 32] = raw.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 bytes are plenty to tell chunks apart in logs.
        write!(f, "Checksum({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Checksum::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid checksum: {s:?}")))
    }
}

/// Compute the checksum of a payload.
pub fn checksum(payload: &[u8]) -> Checksum {
    Checksum(*blake3::hash(payload).as_bytes())
}

/// True if `payload` hashes to `expected`.
pub fn verify_checksum(payload: &[u8], expected: &Checksum) -> bool {
    checksum(payload) == *expected
}
