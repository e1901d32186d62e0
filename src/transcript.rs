use crate::digest_sha2;
use std::fmt;

/// A 32-byte content hash. The only identifier a verifier or a storage layer
/// ever sees for machine data.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash256(arr))
    }

    /// Hash of raw bytes, no domain tag.
    pub fn digest(data: &[u8]) -> Self {
        Hash256(digest_sha2(data))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Absorbing transcript for multi-field commitments.
/// Every commitment starts with a one-byte domain tag and absorbs its fields
/// in a fixed order; two builders that absorb the same fields produce the
/// same hash.
pub struct Transcript {
    state: Vec<u8>,
}

impl Transcript {
    pub fn new(tag: u8) -> Self {
        Self { state: vec![tag] }
    }

    /// Absorb raw bytes into the transcript.
    pub fn absorb(&mut self, data: &[u8]) -> &mut Self {
        self.state.extend_from_slice(data);
        self
    }

    pub fn absorb_u8(&mut self, byte: u8) -> &mut Self {
        self.state.push(byte);
        self
    }

    /// Absorb a u64 as 8 big-endian bytes.
    pub fn absorb_u64(&mut self, value: u64) -> &mut Self {
        self.absorb(&value.to_be_bytes())
    }

    /// Absorb a child commitment.
    pub fn absorb_hash(&mut self, hash: &Hash256) -> &mut Self {
        self.absorb(&hash.0)
    }

    pub fn finalize(&self) -> Hash256 {
        Hash256(digest_sha2(&self.state))
    }
}
