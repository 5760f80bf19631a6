//! peerpost Core
//!
//! This crate provides the foundational types, the data model, the cryptographic
//! message envelope and the in-process event broker shared by the record store and
//! the transport runtime.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod model;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{BrokerConfig, PeerEntry, PeerpostConfig, SessionConfig, StoreConfig};
pub use crypto::{sign_message, verify_message, IdentityKeyPair};
pub use errors::{
    CryptographicError, PeerpostError, PeerpostResult, Result, SessionError, StorageError,
    TransportError,
};
pub use events::{Event, EventBroker, EventPayload, Subscription, Topic};
pub use model::{Account, Contact, Message, MessageState};
pub use types::{PeerId, PublicKeyHex, Timestamp};
