//! Piece content identifiers
//!
//! A piece is addressed by a CIDv1 over the raw payload. The exact piece
//! commitment algorithm used by providers is outside this crate; the
//! identifier here is what the SDK parses, prints and verifies against.

use crate::{PieceError, Result};
use cid::{Cid, Version};
use multihash::Multihash;
use multihash_codetable::{Code, MultihashDigest};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Multicodec for piece payloads (raw, 0x55)
pub const PIECE_CODEC: u64 = 0x55;

/// Multihash code for sha2-256
const SHA2_256: u64 = 0x12;

/// Content address of a piece
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceCid(Cid);

impl PieceCid {
    /// Wrap an already validated CID
    pub fn from_cid(cid: Cid) -> Result<Self> {
        if cid.version() != Version::V1 {
            return Err(PieceError::Unsupported {
                cid: cid.to_string(),
                reason: "expected CIDv1".to_string(),
            });
        }
        if cid.codec() != PIECE_CODEC {
            return Err(PieceError::Unsupported {
                cid: cid.to_string(),
                reason: format!("unexpected codec 0x{:x}", cid.codec()),
            });
        }
        if cid.hash().code() != SHA2_256 {
            return Err(PieceError::Unsupported {
                cid: cid.to_string(),
                reason: format!("unexpected multihash 0x{:x}", cid.hash().code()),
            });
        }
        Ok(Self(cid))
    }

    /// Parse a piece CID from its string form
    pub fn parse(s: &str) -> Result<Self> {
        let cid: Cid = s
            .trim()
            .parse()
            .map_err(|e: cid::Error| PieceError::InvalidCid(format!("{}: {}", s, e)))?;
        Self::from_cid(cid)
    }

    /// The underlying CID
    pub fn cid(&self) -> &Cid {
        &self.0
    }

    /// Raw digest bytes
    pub fn digest(&self) -> &[u8] {
        self.0.hash().digest()
    }
}

impl fmt::Display for PieceCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PieceCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceCid({})", self.0)
    }
}

impl FromStr for PieceCid {
    type Err = PieceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for PieceCid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for PieceCid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Compute the piece CID for a payload
pub fn calculate(data: &[u8]) -> PieceCid {
    PieceCid(Cid::new_v1(PIECE_CODEC, Code::Sha2_256.digest(data)))
}

/// Verify that a payload matches a piece CID
pub fn verify(data: &[u8], piece: &PieceCid) -> bool {
    calculate(data) == *piece
}

/// Incremental verifier for streamed downloads
#[derive(Clone, Default)]
pub struct PieceVerifier {
    hasher: Sha256,
    bytes: u64,
}

impl PieceVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes fed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finish hashing and return the computed piece CID
    pub fn finish(self) -> Result<PieceCid> {
        let digest = self.hasher.finalize();
        let hash = Multihash::<64>::wrap(SHA2_256, &digest)
            .map_err(|e| PieceError::InvalidCid(e.to_string()))?;
        Ok(PieceCid(Cid::new_v1(PIECE_CODEC, hash)))
    }

    /// Finish hashing and check against the expected piece
    pub fn finish_and_check(self, expected: &PieceCid) -> Result<()> {
        let actual = self.finish()?;
        if actual != *expected {
            return Err(PieceError::Mismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_calculate_is_deterministic() {
        let a = calculate(b"piece data");
        let b = calculate(b"piece data");
        assert_eq!(a, b);
        assert_ne!(a, calculate(b"other data"));
    }

    #[test]
    fn test_string_roundtrip() {
        let piece = calculate(b"roundtrip");
        let parsed = PieceCid::parse(&piece.to_string()).unwrap();
        assert_eq!(piece, parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            PieceCid::parse("not-a-cid"),
            Err(PieceError::InvalidCid(_))
        ));
    }

    #[test]
    fn test_parse_rejects_other_codec() {
        let dag_cbor = Cid::new_v1(0x71, Code::Sha2_256.digest(b"x"));
        assert!(matches!(
            PieceCid::parse(&dag_cbor.to_string()),
            Err(PieceError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_serde_as_string() {
        let piece = calculate(b"serde");
        let json = serde_json::to_string(&piece).unwrap();
        assert_eq!(json, format!("\"{}\"", piece));
        let back: PieceCid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, piece);
    }

    #[test]
    fn test_verify() {
        let piece = calculate(b"verify me");
        assert!(verify(b"verify me", &piece));
        assert!(!verify(b"wrong data", &piece));
    }

    #[test]
    fn test_verifier_detects_mismatch() {
        let piece = calculate(b"expected");
        let mut verifier = PieceVerifier::new();
        verifier.update(b"unexpected");
        assert!(matches!(
            verifier.finish_and_check(&piece),
            Err(PieceError::Mismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_chunked_verifier_matches_calculate(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            split in 0usize..2048,
        ) {
            let split = split.min(data.len());
            let mut verifier = PieceVerifier::new();
            verifier.update(&data[..split]);
            verifier.update(&data[split..]);
            prop_assert_eq!(verifier.bytes(), data.len() as u64);
            prop_assert_eq!(verifier.finish().unwrap(), calculate(&data));
        }
    }
}
