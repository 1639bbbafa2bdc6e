//! Schema-versioned byte envelope for structured metadata.
//!
//! Metadata attached to patterns (and optionally to entry values) is stored as
//! an explicit envelope instead of an untyped object, so readers can branch on
//! `schema_version` when the payload layout evolves.
//!
//! Wire layout: `b"SKE"` magic, big-endian `u16` schema version, payload.

use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u16 = 1;

const MAGIC: &[u8; 3] = b"SKE";
const HEADER_LEN: usize = MAGIC.len() + 2;

/// Versioned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Layout version of `payload`.
    pub schema_version: u16,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wraps raw bytes at the given schema version.
    #[must_use]
    pub const fn new(schema_version: u16, payload: Vec<u8>) -> Self {
        Self {
            schema_version,
            payload,
        }
    }

    /// Serializes `value` as JSON at [`CURRENT_SCHEMA_VERSION`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `value` cannot be serialized.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| Error::Validation(format!("unserializable metadata: {e}")))?;
        Ok(Self::new(CURRENT_SCHEMA_VERSION, payload))
    }

    /// Deserializes the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the payload does not match `T`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            Error::Validation(format!(
                "metadata (schema v{}) does not decode: {e}",
                self.schema_version
            ))
        })
    }

    /// Encodes the envelope into its wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.schema_version.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decodes an envelope from its wire form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the header is missing or corrupt.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::Validation(
                "envelope header missing or corrupt".to_string(),
            ));
        }
        let version = u16::from_be_bytes([bytes[3], bytes[4]]);
        Ok(Self::new(version, bytes[HEADER_LEN..].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Meta {
        origin: String,
        steps: u32,
    }

    #[test]
    fn test_json_envelope() {
        let meta = Meta {
            origin: "planner".into(),
            steps: 3,
        };
        let env = Envelope::json(&meta).unwrap();
        assert_eq!(env.schema_version, CURRENT_SCHEMA_VERSION);

        let decoded = Envelope::from_bytes(&env.to_bytes()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.decode_json::<Meta>().unwrap(), meta);
    }

    #[test]
    fn test_preserves_foreign_version() {
        let env = Envelope::new(7, vec![9, 9]);
        let bytes = env.to_bytes();
        assert_eq!(&bytes[..3], b"SKE");
        assert_eq!(Envelope::from_bytes(&bytes).unwrap().schema_version, 7);
    }

    #[test]
    fn test_corrupt_header() {
        assert!(Envelope::from_bytes(b"SK").is_err());
        assert!(Envelope::from_bytes(b"XYZ\0\x01{}").is_err());
    }
}
