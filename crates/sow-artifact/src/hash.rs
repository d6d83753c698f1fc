//! Checksums for artifact payloads, clause fingerprints, finding ids and
//! idempotency keys. All of them are Blake3; hex on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Blake3 digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Digest of raw bytes
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }

    /// Digest of an ordered field list
    ///
    /// Each field is prefixed with its length, so `["ab", "c"]` and
    /// `["a", "bc"]` differ.
    #[must_use]
    pub fn of_fields<I, P>(fields: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            let field = field.as_ref();
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        Self(hasher.finalize().into())
    }

    /// Digest of a payload's canonical JSON
    ///
    /// # Errors
    /// `Encode` if the payload does not serialize
    pub fn of_payload<T: Serialize>(payload: &T) -> Result<Self, HashError> {
        canonical_json(payload).map(|bytes| Self::of(&bytes))
    }

    /// First eight bytes as hex, for logs and display ids
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

/// Compact JSON with object keys sorted
///
/// Lowering through `serde_json::Value` sorts keys, so equal payloads encode
/// to equal bytes whatever map type they were built from.
///
/// # Errors
/// `Encode` if the value does not serialize
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, HashError> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}

impl TryFrom<String> for ContentHash {
    type Error = HashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Checksum failures
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("bad checksum hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("payload does not encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn field_boundaries_matter() {
        assert_ne!(ContentHash::of_fields(["ab", "c"]), ContentHash::of_fields(["a", "bc"]));
        assert_eq!(ContentHash::of_fields(["a", "b"]), ContentHash::of_fields(["a", "b"]));
    }

    #[test]
    fn payload_digest_does_not_depend_on_map_type_or_order() {
        let hashed: HashMap<&str, u32> = [("zeta", 1), ("alpha", 2)].into_iter().collect();
        let sorted: BTreeMap<&str, u32> = [("alpha", 2), ("zeta", 1)].into_iter().collect();
        assert_eq!(
            ContentHash::of_payload(&hashed).unwrap(),
            ContentHash::of_payload(&sorted).unwrap()
        );
    }

    #[test]
    fn hex_round_trip_and_short_prefix() {
        let hash = ContentHash::of(b"clause text");
        let text = hash.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.starts_with(&hash.short()));
        assert_eq!(text.parse::<ContentHash>().unwrap(), hash);
        assert_eq!(serde_json::to_string(&hash).unwrap(), format!("\"{text}\""));
    }

    #[test]
    fn truncated_hex_is_rejected() {
        let text = ContentHash::of(b"x").to_string();
        assert!(matches!(text[..62].parse::<ContentHash>(), Err(HashError::Hex(_))));
        assert!(serde_json::from_str::<ContentHash>("\"zz\"").is_err());
    }
}
