//! peerpost Runtime
//!
//! The session manager that carries messages between accounts:
//! - `SessionBuilder` / `SessionHandle`: start the supervisor and send through it
//! - `host` and `secure`: TCP listener and dialer behind a Noise XX handshake
//! - `peer`: per-contact reader and writer loops
//! - `mailbox`: bounded per-contact inbound and outbound queues
//! - `frame`: the length-prefixed wire framing
//!
//! Storage and the data model live in `peerpost-store` and `peerpost-core`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod directory;
pub mod frame;
pub mod host;
pub mod mailbox;
pub mod peer;
pub mod secure;
mod session;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use directory::{PeerDirectory, StaticDirectory};
pub use host::{dial, Connection, Host};
pub use mailbox::{Mailbox, MailboxReceiver, Mailboxes, OfferError};
pub use secure::{RemoteIdentity, Role, PROTOCOL_ID};
pub use session::{SessionBuilder, SessionHandle, SessionState};

// Re-export core types for convenience
pub use peerpost_core::{
    Message, MessageState, PeerId, PeerpostError, PeerpostResult, PublicKeyHex, SessionConfig,
    Timestamp,
};
pub use peerpost_store::RecordStore;
