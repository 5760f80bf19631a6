//! Peer address lookup

use std::net::SocketAddr;

use async_trait::async_trait;
use dashmap::DashMap;

use peerpost_core::{PeerEntry, PublicKeyHex, Result};

/// Resolves a contact's public key to a dialable address
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn resolve(&self, peer: &PublicKeyHex) -> Option<SocketAddr>;
}

/// Directory backed by a fixed table, usually loaded from configuration
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: DashMap<PublicKeyHex, SocketAddr>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured peers; malformed keys are rejected
    pub fn from_entries(entries: &[PeerEntry]) -> Result<Self> {
        let directory = Self::new();
        for entry in entries {
            let key: PublicKeyHex = entry.public_key.parse()?;
            directory.insert(key, entry.address);
        }
        Ok(directory)
    }

    pub fn insert(&self, peer: PublicKeyHex, address: SocketAddr) {
        self.entries.insert(peer, address);
    }

    pub fn remove(&self, peer: &PublicKeyHex) -> Option<SocketAddr> {
        self.entries.remove(peer).map(|(_, address)| address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    async fn resolve(&self, peer: &PublicKeyHex) -> Option<SocketAddr> {
        self.entries.get(peer).map(|entry| *entry.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory() {
        let key = PublicKeyHex::from_bytes(&[7u8; 32]);
        let address: SocketAddr = "127.0.0.1:4100".parse().unwrap();
        let directory = StaticDirectory::from_entries(&[PeerEntry {
            public_key: key.to_string(),
            address,
        }])
        .unwrap();

        assert_eq!(directory.resolve(&key).await, Some(address));
        assert_eq!(directory.remove(&key), Some(address));
        assert!(directory.resolve(&key).await.is_none());
        assert!(directory.is_empty());
    }

    #[test]
    fn test_malformed_entry_rejected() {
        let entry = PeerEntry {
            public_key: "not-hex".into(),
            address: "127.0.0.1:1".parse().unwrap(),
        };
        assert!(StaticDirectory::from_entries(&[entry]).is_err());
    }
}
