//! Persisted record types
//!
//! Accounts, contacts and messages are the three record kinds owned by the record
//! store. The only mutable part of a [`Message`] after creation is its
//! [`MessageState`], which may only move forward.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::errors::{PeerpostError, Result};
use crate::types::{PublicKeyHex, Timestamp};

// ----------------------------------------------------------------------------
// Message State
// ----------------------------------------------------------------------------

/// Delivery/read state of a message, decided by its recipient
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum MessageState {
    #[default]
    Stateless = 0,
    Received = 1,
    Read = 2,
}

impl MessageState {
    /// Monotonic merge: the furthest state wins
    pub fn merge(self, other: MessageState) -> MessageState {
        self.max(other)
    }

    pub fn is_read(self) -> bool {
        self == MessageState::Read
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageState::Stateless => "stateless",
            MessageState::Received => "received",
            MessageState::Read => "read",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Account
// ----------------------------------------------------------------------------

/// A local identity. The account with the newest `updated_at` is current.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Hex-encoded 32-byte Ed25519 seed
    pub private_key: String,
    pub public_key: PublicKeyHex,
    pub chain_address: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Account {
    pub fn validate(&self) -> Result<()> {
        if self.private_key.is_empty() {
            return Err(PeerpostError::invalid_record("account has no private key"));
        }
        if self.created_at.is_unset() || self.updated_at.is_unset() {
            return Err(PeerpostError::invalid_record("account timestamps are unset"));
        }
        Ok(())
    }
}

// Private key material stays out of log lines.
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("public_key", &self.public_key)
            .field("chain_address", &self.chain_address)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Contact
// ----------------------------------------------------------------------------

/// A remote peer known to one local account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub account_public_key: PublicKeyHex,
    pub public_key: PublicKeyHex,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub avatar: Option<Vec<u8>>,
    pub identified: bool,
}

impl Contact {
    /// New contact stamped with the current time
    pub fn new(account_public_key: PublicKeyHex, public_key: PublicKeyHex) -> Self {
        let now = Timestamp::now();
        Self {
            account_public_key,
            public_key,
            created_at: now,
            updated_at: now,
            avatar: None,
            identified: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.account_public_key == self.public_key {
            return Err(PeerpostError::invalid_record(
                "contact cannot be the account itself",
            ));
        }
        if self.created_at.is_unset() || self.updated_at.is_unset() {
            return Err(PeerpostError::invalid_record("contact timestamps are unset"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// A signed text/audio message between two principals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: PublicKeyHex,
    pub recipient: PublicKeyHex,
    pub created_at: Timestamp,
    pub text: String,
    pub audio: Option<Vec<u8>>,
    /// Detached Ed25519 signature over the record with this field emptied
    pub signature: Vec<u8>,
    pub state: MessageState,
}

impl Message {
    /// New unsigned, stateless message with a fresh UUID v4 identifier
    pub fn new(
        sender: PublicKeyHex,
        recipient: PublicKeyHex,
        text: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
            recipient,
            created_at,
            text: text.into(),
            audio: None,
            signature: Vec::new(),
            state: MessageState::Stateless,
        }
    }

    pub fn with_audio(mut self, audio: Vec<u8>) -> Self {
        self.audio = Some(audio);
        self
    }

    /// Whether `account` wrote this message
    pub fn is_authored_by(&self, account: &PublicKeyHex) -> bool {
        &self.sender == account
    }

    /// The side of the conversation that is not `account`
    ///
    /// Fails when `account` is neither sender nor recipient.
    pub fn counterpart(&self, account: &PublicKeyHex) -> Result<&PublicKeyHex> {
        if &self.sender == account {
            Ok(&self.recipient)
        } else if &self.recipient == account {
            Ok(&self.sender)
        } else {
            Err(PeerpostError::identity_mismatch(
                account.as_str(),
                format!("{} -> {}", self.sender, self.recipient),
            ))
        }
    }

    /// Check the fields required to persist this message under `account`
    pub fn validate_for(&self, account: &PublicKeyHex) -> Result<()> {
        if self.id.is_empty() {
            return Err(PeerpostError::invalid_record("message has no id"));
        }
        if self.created_at.is_unset() {
            return Err(PeerpostError::invalid_record("message has no creation time"));
        }
        if self.sender == self.recipient {
            return Err(PeerpostError::invalid_record(
                "message sender and recipient are equal",
            ));
        }
        self.counterpart(account)?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
