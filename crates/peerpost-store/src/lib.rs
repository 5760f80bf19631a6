//! peerpost Store
//!
//! Encrypted, sled-backed persistence for accounts, contacts and messages. Records
//! are addressed by composite `[]`-separated keys (see [`keys`]) so that one
//! account's contacts and one conversation's messages are each a single prefix
//! scan. Every mutation is committed atomically and then announced on the shared
//! [`peerpost_core::EventBroker`].

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

mod accounts;
mod contacts;
pub mod engine;
pub mod keys;
mod messages;
mod store;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use engine::{RecordBatch, StorageEngine};
pub use messages::SaveOutcome;
pub use store::RecordStore;
