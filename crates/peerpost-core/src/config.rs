//! Centralized Configuration Management
//!
//! All tunables of the store, the event broker and the session manager live here,
//! loadable from a TOML file. Every section has a `Default` and a `testing()`
//! preset with short timers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{PeerpostError, Result};
use crate::events::DEFAULT_SUBSCRIBER_CAPACITY;

// ----------------------------------------------------------------------------
// Store Configuration
// ----------------------------------------------------------------------------

/// Configuration for the encrypted record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the sled database
    pub path: PathBuf,
    /// Argon2id memory cost in KiB
    pub kdf_memory_kib: u32,
    /// Argon2id passes
    pub kdf_iterations: u32,
    /// Argon2id lanes
    pub kdf_parallelism: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("peerpost-db"),
            kdf_memory_kib: 19_456, // 19 MiB
            kdf_iterations: 2,
            kdf_parallelism: 1,
        }
    }
}

impl StoreConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            path: PathBuf::from("peerpost-test-db"),
            kdf_memory_kib: 64,
            kdf_iterations: 1,
            kdf_parallelism: 1,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }
}

// ----------------------------------------------------------------------------
// Broker Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Events buffered per subscription before the oldest is dropped
    pub subscriber_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Configuration for the transport session manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Address the host listens on
    pub listen_addr: SocketAddr,
    /// Period of the reconciliation pass
    pub reconcile_interval_ms: u64,
    /// Delay between attempts to bring the host up
    pub host_retry_interval_ms: u64,
    /// Maximum time for a Noise handshake to complete
    pub handshake_timeout_ms: u64,
    /// Capacity of each per-contact outbound mailbox
    pub outbound_capacity: usize,
    /// Capacity of each per-contact inbound mailbox
    pub inbound_capacity: usize,
    /// Largest accepted wire frame payload
    pub max_frame_len: usize,
    /// Contacts loaded per reconciliation page
    pub contacts_page_size: usize,
    /// Messages loaded per reconciliation page
    pub messages_page_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            reconcile_interval_ms: 1_000,
            host_retry_interval_ms: 100,
            handshake_timeout_ms: 10_000,
            outbound_capacity: 10,
            inbound_capacity: 10,
            max_frame_len: 16 * 1024 * 1024,
            contacts_page_size: 50,
            messages_page_size: 100,
        }
    }
}

impl SessionConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            reconcile_interval_ms: 100,
            host_retry_interval_ms: 20,
            handshake_timeout_ms: 2_000,
            ..Self::default()
        }
    }

    pub fn reconcile_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn host_retry_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.host_retry_interval_ms)
    }

    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.handshake_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Peer Directory Configuration
// ----------------------------------------------------------------------------

/// A statically known peer address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Hex Ed25519 public key of the peer
    pub public_key: String,
    pub address: SocketAddr,
}

// ----------------------------------------------------------------------------
// Master Configuration
// ----------------------------------------------------------------------------

/// Master configuration consolidating every section
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerpostConfig {
    pub peers: Vec<PeerEntry>,
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub session: SessionConfig,
}

impl PeerpostConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            peers: Vec::new(),
            store: StoreConfig::testing(),
            broker: BrokerConfig::default(),
            session: SessionConfig::testing(),
        }
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| PeerpostError::config_error(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PeerpostError::config_error(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PeerpostError::config_error(format!("failed to encode TOML: {e}")))
    }

    /// Validate the configuration for consistency and feasibility
    pub fn validate(&self) -> Result<()> {
        let s = &self.session;
        if s.outbound_capacity == 0 || s.inbound_capacity == 0 {
            return Err(PeerpostError::config_error("mailbox capacity cannot be zero"));
        }
        if s.reconcile_interval_ms == 0 || s.host_retry_interval_ms == 0 {
            return Err(PeerpostError::config_error("session intervals cannot be zero"));
        }
        if s.contacts_page_size == 0 || s.messages_page_size == 0 {
            return Err(PeerpostError::config_error("page sizes cannot be zero"));
        }
        if s.max_frame_len == 0 || s.max_frame_len > u32::MAX as usize {
            return Err(PeerpostError::config_error(
                "max frame length must fit in 32 bits",
            ));
        }
        if self.broker.subscriber_capacity == 0 {
            return Err(PeerpostError::config_error(
                "subscriber capacity cannot be zero",
            ));
        }
        if self.store.kdf_iterations == 0 || self.store.kdf_parallelism == 0 {
            return Err(PeerpostError::config_error("KDF parameters cannot be zero"));
        }
        for peer in &self.peers {
            peer.public_key.parse::<crate::types::PublicKeyHex>().map_err(|_| {
                PeerpostError::config_error(format!("invalid peer key {}", peer.public_key))
            })?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
