//! Composite key codec
//!
//! Every record lives under a `[]`-separated ASCII key whose leading tokens group
//! related records together, so that a prefix scan enumerates exactly one account's
//! contacts or one conversation's messages:
//!
//! ```text
//! accounts[]<updated_at>[]<created_at>[]<public_key>
//! contacts[]<account>[]<contact>[]<updated_at>[]<created_at>
//! messages[]<account>[]<contact>[]<created_at>[]<sender>[]<recipient>[]<id>
//! ```
//!
//! Timestamps are rendered as 20-digit zero-padded nanoseconds so that
//! lexicographic order is chronological order.

use peerpost_core::{
    Account, Contact, Message, PeerpostError, PublicKeyHex, Result, StorageError, Timestamp,
};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

pub const KEY_SEPARATOR: &str = "[]";
pub const PREFIX_ACCOUNTS: &str = "accounts";
pub const PREFIX_CONTACTS: &str = "contacts";
pub const PREFIX_MESSAGES: &str = "messages";

/// Token positions inside an account key
pub mod account_token {
    pub const UPDATED_AT: usize = 1;
    pub const CREATED_AT: usize = 2;
    pub const PUBLIC_KEY: usize = 3;
    pub const COUNT: usize = 4;
}

/// Token positions inside a contact key
pub mod contact_token {
    pub const ACCOUNT: usize = 1;
    pub const CONTACT: usize = 2;
    pub const UPDATED_AT: usize = 3;
    pub const CREATED_AT: usize = 4;
    pub const COUNT: usize = 5;
}

/// Token positions inside a message key
pub mod message_token {
    pub const ACCOUNT: usize = 1;
    pub const CONTACT: usize = 2;
    pub const CREATED_AT: usize = 3;
    pub const SENDER: usize = 4;
    pub const RECIPIENT: usize = 5;
    pub const ID: usize = 6;
    pub const COUNT: usize = 7;
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn invalid_key(key: &str) -> PeerpostError {
    StorageError::InvalidKey {
        key: key.to_string(),
    }
    .into()
}

pub fn format_timestamp(ts: Timestamp) -> String {
    format!("{:020}", ts.as_nanos())
}

fn parse_timestamp(token: &str, key: &str) -> Result<Timestamp> {
    if token.len() != 20 {
        return Err(invalid_key(key));
    }
    token
        .parse::<u64>()
        .map(Timestamp::new)
        .map_err(|_| invalid_key(key))
}

fn join(tokens: &[&str]) -> String {
    tokens.join(KEY_SEPARATOR)
}

/// Split a key into its tokens
pub fn split_key(key: &str) -> Vec<&str> {
    key.split(KEY_SEPARATOR).collect()
}

/// Whether any token of `key` equals `component`
pub fn has_component(key: &str, component: &str) -> bool {
    key.split(KEY_SEPARATOR).any(|token| token == component)
}

/// Number of tokens in a complete key of the record kind named by `kind`
fn record_token_count(kind: &str) -> Option<usize> {
    match kind {
        PREFIX_ACCOUNTS => Some(account_token::COUNT),
        PREFIX_CONTACTS => Some(contact_token::COUNT),
        PREFIX_MESSAGES => Some(message_token::COUNT),
        _ => None,
    }
}

/// Truncate a full or partial key to its first `position + 1` tokens
///
/// The result ends with the separator so the prefix only matches whole tokens,
/// unless `position` is the last token of a complete record key, in which case
/// the key itself is returned.
pub fn scan_prefix(prefix_or_full_key: &str, position: usize) -> Result<String> {
    let tokens = split_key(prefix_or_full_key);
    if tokens.len() < position + 1 || tokens[..=position].iter().any(|t| t.is_empty()) {
        return Err(invalid_key(prefix_or_full_key));
    }
    let mut prefix = join(&tokens[..=position]);
    if record_token_count(tokens[0]) != Some(position + 1) {
        prefix.push_str(KEY_SEPARATOR);
    }
    Ok(prefix)
}

fn check_component(component: &str) -> Result<()> {
    if component.is_empty() || component.contains(KEY_SEPARATOR) {
        return Err(invalid_key(component));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Account Keys
// ----------------------------------------------------------------------------

pub fn account_key(account: &Account) -> Result<String> {
    if account.created_at.is_unset() || account.updated_at.is_unset() {
        return Err(PeerpostError::invalid_record("account timestamps are unset"));
    }
    Ok(join(&[
        PREFIX_ACCOUNTS,
        &format_timestamp(account.updated_at),
        &format_timestamp(account.created_at),
        account.public_key.as_str(),
    ]))
}

/// Prefix matching every account key
pub fn accounts_prefix() -> String {
    format!("{PREFIX_ACCOUNTS}{KEY_SEPARATOR}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountKey {
    pub updated_at: Timestamp,
    pub created_at: Timestamp,
    pub public_key: PublicKeyHex,
}

impl AccountKey {
    pub fn parse(key: &str) -> Result<Self> {
        let tokens = split_key(key);
        if tokens.len() != account_token::COUNT || tokens[0] != PREFIX_ACCOUNTS {
            return Err(invalid_key(key));
        }
        Ok(Self {
            updated_at: parse_timestamp(tokens[account_token::UPDATED_AT], key)?,
            created_at: parse_timestamp(tokens[account_token::CREATED_AT], key)?,
            public_key: tokens[account_token::PUBLIC_KEY]
                .parse()
                .map_err(|_| invalid_key(key))?,
        })
    }
}

// ----------------------------------------------------------------------------
// Contact Keys
// ----------------------------------------------------------------------------

pub fn contact_key(contact: &Contact) -> Result<String> {
    if contact.created_at.is_unset() || contact.updated_at.is_unset() {
        return Err(PeerpostError::invalid_record("contact timestamps are unset"));
    }
    Ok(join(&[
        PREFIX_CONTACTS,
        contact.account_public_key.as_str(),
        contact.public_key.as_str(),
        &format_timestamp(contact.updated_at),
        &format_timestamp(contact.created_at),
    ]))
}

/// Prefix matching every contact of `account`
pub fn contacts_prefix(account: &PublicKeyHex) -> String {
    format!("{}{KEY_SEPARATOR}", join(&[PREFIX_CONTACTS, account.as_str()]))
}

/// Prefix matching the stored copies of one contact
pub fn contact_prefix(account: &PublicKeyHex, contact: &PublicKeyHex) -> String {
    format!(
        "{}{KEY_SEPARATOR}",
        join(&[PREFIX_CONTACTS, account.as_str(), contact.as_str()])
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactKey {
    pub account: PublicKeyHex,
    pub contact: PublicKeyHex,
    pub updated_at: Timestamp,
    pub created_at: Timestamp,
}

impl ContactKey {
    pub fn parse(key: &str) -> Result<Self> {
        let tokens = split_key(key);
        if tokens.len() != contact_token::COUNT || tokens[0] != PREFIX_CONTACTS {
            return Err(invalid_key(key));
        }
        Ok(Self {
            account: tokens[contact_token::ACCOUNT]
                .parse()
                .map_err(|_| invalid_key(key))?,
            contact: tokens[contact_token::CONTACT]
                .parse()
                .map_err(|_| invalid_key(key))?,
            updated_at: parse_timestamp(tokens[contact_token::UPDATED_AT], key)?,
            created_at: parse_timestamp(tokens[contact_token::CREATED_AT], key)?,
        })
    }
}

// ----------------------------------------------------------------------------
// Message Keys
// ----------------------------------------------------------------------------

/// Full key of `message` as stored under `account`
pub fn message_key(account: &PublicKeyHex, message: &Message) -> Result<String> {
    message.validate_for(account)?;
    check_component(&message.id)?;
    let contact = message.counterpart(account)?;
    Ok(join(&[
        PREFIX_MESSAGES,
        account.as_str(),
        contact.as_str(),
        &format_timestamp(message.created_at),
        message.sender.as_str(),
        message.recipient.as_str(),
        &message.id,
    ]))
}

/// Prefix matching every message exchanged between `account` and `contact`
pub fn conversation_prefix(account: &PublicKeyHex, contact: &PublicKeyHex) -> String {
    format!(
        "{}{KEY_SEPARATOR}",
        join(&[PREFIX_MESSAGES, account.as_str(), contact.as_str()])
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKey {
    pub account: PublicKeyHex,
    pub contact: PublicKeyHex,
    pub created_at: Timestamp,
    pub sender: PublicKeyHex,
    pub recipient: PublicKeyHex,
    pub id: String,
}

impl MessageKey {
    pub fn parse(key: &str) -> Result<Self> {
        let tokens = split_key(key);
        if tokens.len() != message_token::COUNT || tokens[0] != PREFIX_MESSAGES {
            return Err(invalid_key(key));
        }
        let parse_key = |index: usize| -> Result<PublicKeyHex> {
            tokens[index].parse().map_err(|_| invalid_key(key))
        };
        Ok(Self {
            account: parse_key(message_token::ACCOUNT)?,
            contact: parse_key(message_token::CONTACT)?,
            created_at: parse_timestamp(tokens[message_token::CREATED_AT], key)?,
            sender: parse_key(message_token::SENDER)?,
            recipient: parse_key(message_token::RECIPIENT)?,
            id: tokens[message_token::ID].to_string(),
        })
    }

    /// Whether the contact wrote the message
    pub fn is_inbound(&self) -> bool {
        self.sender == self.contact && self.recipient == self.account
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(byte: u8) -> PublicKeyHex {
        PublicKeyHex::from_bytes(&[byte; 32])
    }

    #[test]
    fn test_timestamp_padding_orders_lexicographically() {
        let small = format_timestamp(Timestamp::new(9));
        let large = format_timestamp(Timestamp::new(10));
        assert_eq!(small.len(), 20);
        assert!(small < large);
        assert_eq!(format_timestamp(Timestamp::new(u64::MAX)).len(), 20);
    }

    #[test]
    fn test_account_key_round_trip() {
        let account = Account {
            private_key: "00".repeat(32),
            public_key: pk(1),
            chain_address: "0x".into(),
            created_at: Timestamp::new(100),
            updated_at: Timestamp::new(200),
        };
        let key = account_key(&account).unwrap();
        assert!(key.starts_with(&accounts_prefix()));
        let parsed = AccountKey::parse(&key).unwrap();
        assert_eq!(parsed.public_key, pk(1));
        assert_eq!(parsed.created_at, Timestamp::new(100));
        assert_eq!(parsed.updated_at, Timestamp::new(200));
    }

    #[test]
    fn test_contact_key_round_trip() {
        let mut contact = Contact::new(pk(1), pk(2));
        contact.created_at = Timestamp::new(5);
        contact.updated_at = Timestamp::new(6);
        let key = contact_key(&contact).unwrap();
        assert!(key.starts_with(&contacts_prefix(&pk(1))));
        assert!(key.starts_with(&contact_prefix(&pk(1), &pk(2))));
        let parsed = ContactKey::parse(&key).unwrap();
        assert_eq!(parsed.account, pk(1));
        assert_eq!(parsed.contact, pk(2));
        assert_eq!(parsed.updated_at, Timestamp::new(6));
    }

    #[test]
    fn test_message_key_groups_by_conversation() {
        let outgoing = Message::new(pk(1), pk(2), "hi", Timestamp::new(10));
        let incoming = Message::new(pk(2), pk(1), "hey", Timestamp::new(11));

        let out_key = message_key(&pk(1), &outgoing).unwrap();
        let in_key = message_key(&pk(1), &incoming).unwrap();
        let prefix = conversation_prefix(&pk(1), &pk(2));
        assert!(out_key.starts_with(&prefix));
        assert!(in_key.starts_with(&prefix));

        let parsed = MessageKey::parse(&in_key).unwrap();
        assert!(parsed.is_inbound());
        assert_eq!(parsed.id, incoming.id);
        assert!(!MessageKey::parse(&out_key).unwrap().is_inbound());

        assert!(message_key(&pk(3), &outgoing).is_err());
    }

    #[test]
    fn test_message_id_cannot_contain_separator() {
        let mut msg = Message::new(pk(1), pk(2), "hi", Timestamp::new(10));
        msg.id = "a[]b".into();
        assert!(message_key(&pk(1), &msg).is_err());
    }

    #[test]
    fn test_scan_prefix_truncation() {
        let key = "messages[]a[]b[]c";
        assert_eq!(scan_prefix(key, 0).unwrap(), "messages[]");
        assert_eq!(scan_prefix(key, 1).unwrap(), "messages[]a[]");
        assert_eq!(scan_prefix(key, 3).unwrap(), "messages[]a[]b[]c[]");
        assert!(scan_prefix(key, 4).is_err());
        assert_eq!(scan_prefix("accounts", 0).unwrap(), "accounts[]");
        assert_eq!(scan_prefix("accounts[]", 0).unwrap(), "accounts[]");
        assert!(scan_prefix("messages[][]b", 1).is_err());

        let full = "accounts[]00000000000000000002[]00000000000000000001[]pk";
        assert_eq!(scan_prefix(full, account_token::PUBLIC_KEY).unwrap(), full);
    }

    #[test]
    fn test_scan_prefix_matches_whole_tokens_only() {
        let prefix = scan_prefix("messages[]ab", 1).unwrap();
        assert_eq!(prefix, "messages[]ab[]");
        assert!("messages[]ab[]x".starts_with(&prefix));
        assert!(!"messages[]abc[]x".starts_with(&prefix));
    }

    #[test]
    fn test_component_matching_is_token_exact() {
        let key = "contacts[]abc[]abcd[]1[]2";
        assert!(has_component(key, "abc"));
        assert!(!has_component(key, "ab"));
        assert!(has_component(key, "abcd"));
        assert!(!has_component(key, "contact"));
    }

    #[test]
    fn test_malformed_keys_rejected() {
        assert!(AccountKey::parse("accounts[]1[]2").is_err());
        assert!(ContactKey::parse("messages[]a[]b[]c[]d").is_err());
        assert!(MessageKey::parse("messages[]x[]y[]z[]a[]b[]c").is_err());
    }
}
