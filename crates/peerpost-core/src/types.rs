//! Core types for peerpost
//!
//! This module defines the fundamental identifiers used throughout the workspace,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::ops::Deref;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{CryptographicError, PeerpostError};

// ----------------------------------------------------------------------------
// Public Key (hex)
// ----------------------------------------------------------------------------

/// Lowercase hex encoding of a 32-byte Ed25519 public key
///
/// This is the form in which account and contact keys appear in store keys,
/// message sender/recipient fields and the public API.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKeyHex(String);

impl PublicKeyHex {
    /// Create from raw public key bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Decode back to raw key bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        // Validated on construction, so decoding cannot fail here.
        if let Ok(bytes) = hex::decode(&self.0) {
            out.copy_from_slice(&bytes);
        }
        out
    }

    /// Get the hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the peer identity for this key
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.to_bytes())
    }
}

impl fmt::Display for PublicKeyHex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PublicKeyHex {
    type Err = PeerpostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean_str = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(clean_str).map_err(|_| CryptographicError::InvalidKeyFormat)?;
        if bytes.len() != 32 {
            return Err(CryptographicError::InvalidKeyFormat.into());
        }
        Ok(Self(clean_str.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for PublicKeyHex {
    type Error = PeerpostError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PublicKeyHex> for String {
    fn from(value: PublicKeyHex) -> Self {
        value.0
    }
}

impl AsRef<str> for PublicKeyHex {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// Network identity of a peer: SHA-256 of its raw Ed25519 public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Create a new PeerId from 32 bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the PeerId of a public key
    pub fn from_public_key<T: AsRef<[u8]>>(public_key: T) -> Self {
        let hash = Sha256::digest(public_key.as_ref());
        let mut id = [0u8; 32];
        id.copy_from_slice(&hash);
        Self(id)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Deref for PeerId {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Nanosecond timestamp since Unix epoch; zero means unset
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp
    pub const fn new(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Get current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
    }

    /// Get the raw nanoseconds
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_nanos(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_hex_parsing() {
        let bytes = [0xABu8; 32];
        let key = PublicKeyHex::from_bytes(&bytes);
        assert_eq!(key.as_str().len(), 64);
        assert_eq!(key.to_bytes(), bytes);

        let upper = key.as_str().to_uppercase();
        let parsed: PublicKeyHex = upper.parse().unwrap();
        assert_eq!(parsed, key);

        assert!("abcd".parse::<PublicKeyHex>().is_err());
        assert!("zz".repeat(32).parse::<PublicKeyHex>().is_err());
    }

    #[test]
    fn test_public_key_hex_serde_rejects_garbage() {
        let good = PublicKeyHex::from_bytes(&[7u8; 32]);
        let encoded = bincode::serialize(&good).unwrap();
        let decoded: PublicKeyHex = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, good);

        let bad = bincode::serialize(&"not-a-key".to_string()).unwrap();
        assert!(bincode::deserialize::<PublicKeyHex>(&bad).is_err());
    }

    #[test]
    fn test_peer_id_is_sha256_of_key() {
        let key = PublicKeyHex::from_bytes(&[1u8; 32]);
        let expected = Sha256::digest([1u8; 32]);
        assert_eq!(key.peer_id().as_bytes().as_slice(), expected.as_slice());
        assert_eq!(key.peer_id().short().len(), 12);
    }

    #[test]
    fn test_timestamp_ordering() {
        let earlier = Timestamp::new(10);
        let later = Timestamp::new(25);
        assert!(earlier < later);
        assert_eq!(later.duration_since(earlier).as_nanos(), 15);
        assert_eq!(earlier.duration_since(later).as_nanos(), 0);
        assert!(Timestamp::default().is_unset());
        assert!(!Timestamp::now().is_unset());
    }
}
