//! Message records
//!
//! Messages live under their conversation prefix and are returned oldest first.
//! A message is identified by its id within a conversation: saving a known id
//! merges into the stored copy, and the merged state can only move forward.

use tracing::{debug, warn};

use peerpost_core::{
    EventPayload, Message, MessageState, PeerpostError, PublicKeyHex, Result, StorageError,
};

use crate::contacts::stage_contact_refresh;
use crate::keys::{contact_prefix, conversation_prefix, message_key, message_token, MessageKey};
use crate::store::{page, RecordStore};

/// What `save_or_update_message` did with the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// First copy of this message id in the conversation
    Inserted,
    /// Known message whose state moved forward from the given state
    StateRaised(MessageState),
    /// Known message; nothing changed
    Unchanged,
}

impl RecordStore {
    /// One page of the conversation between `account` and `contact`, oldest first
    pub fn messages(
        &self,
        account: &PublicKeyHex,
        contact: &PublicKeyHex,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let engine = self.engine()?;
        let keys = self.conversation_keys(account, contact, false)?;
        let mut messages = Vec::new();
        for key in page(keys, offset, limit) {
            if let Some(message) = engine.get::<Message>(&key)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    pub fn messages_count(&self, account: &PublicKeyHex, contact: &PublicKeyHex) -> Result<usize> {
        self.engine()?
            .count_prefix(&conversation_prefix(account, contact))
    }

    /// Messages written by `contact` that `account` has not read yet
    pub fn unread_messages_count(
        &self,
        account: &PublicKeyHex,
        contact: &PublicKeyHex,
    ) -> Result<usize> {
        let engine = self.engine()?;
        let mut count = 0;
        for key in engine.keys_with_prefix(&conversation_prefix(account, contact))? {
            if !MessageKey::parse(&key)?.is_inbound() {
                continue;
            }
            if let Some(message) = engine.get::<Message>(&key)? {
                if message.state < MessageState::Read {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Newest message of the conversation
    pub fn last_message(
        &self,
        account: &PublicKeyHex,
        contact: &PublicKeyHex,
    ) -> Result<Option<Message>> {
        let keys = self.conversation_keys(account, contact, true)?;
        match keys.first() {
            Some(key) => self.engine()?.get(key),
            None => Ok(None),
        }
    }

    /// Look up one message of the conversation by id
    pub fn message(
        &self,
        account: &PublicKeyHex,
        contact: &PublicKeyHex,
        id: &str,
    ) -> Result<Option<Message>> {
        let engine = self.engine()?;
        for key in engine.keys_with_prefix(&conversation_prefix(account, contact))? {
            if MessageKey::parse(&key)?.id == id {
                return engine.get(&key);
            }
        }
        Ok(None)
    }

    /// Insert `message` or merge it into the stored copy with the same id
    ///
    /// On return `message` holds the record as stored. New messages written by the
    /// contact are stored at least as `Received`. Known messages only ever have
    /// their state raised; duplicate copies are removed. The contact is created or
    /// refreshed in the same commit whenever the conversation changes.
    pub fn save_or_update_message(
        &self,
        account: &PublicKeyHex,
        message: &mut Message,
    ) -> Result<SaveOutcome> {
        self.save_message(account, message, true)
    }

    /// Merge the state of `message` into the stored copy with the same id
    ///
    /// Unlike [`Self::save_or_update_message`] this never creates a record; an
    /// unknown id fails with [`StorageError::NotFound`].
    pub fn merge_message_state(
        &self,
        account: &PublicKeyHex,
        message: &mut Message,
    ) -> Result<SaveOutcome> {
        self.save_message(account, message, false)
    }

    fn save_message(
        &self,
        account: &PublicKeyHex,
        message: &mut Message,
        allow_insert: bool,
    ) -> Result<SaveOutcome> {
        let full_key = message_key(account, message)?;
        let contact = message.counterpart(account)?.clone();

        let (outcome, saved_contact) = {
            let _guard = self.write_guard()?;
            let engine = self.engine()?;

            let copies: Vec<String> = self
                .conversation_keys(account, &contact, true)?
                .into_iter()
                .filter(|key| {
                    MessageKey::parse(key)
                        .map(|parsed| parsed.id == message.id)
                        .unwrap_or(false)
                })
                .collect();

            let mut batch = engine.batch();
            let outcome = match copies.split_first() {
                Some((kept, duplicates)) => {
                    let mut stored: Message = engine.get(kept)?.ok_or_else(|| {
                        PeerpostError::invalid_record(format!("message {} vanished", message.id))
                    })?;
                    for key in duplicates {
                        warn!(id = %message.id, "removing duplicate message copy");
                        batch.remove(key);
                    }
                    let previous = stored.state;
                    stored.state = previous.merge(message.state);
                    let outcome = if stored.state > previous {
                        batch.insert(kept, &stored)?;
                        SaveOutcome::StateRaised(previous)
                    } else {
                        SaveOutcome::Unchanged
                    };
                    *message = stored;
                    outcome
                }
                None if !allow_insert => {
                    return Err(StorageError::NotFound {
                        what: format!("message {}", message.id),
                    }
                    .into());
                }
                None => {
                    if !message.is_authored_by(account) {
                        message.state = message.state.merge(MessageState::Received);
                    }
                    batch.insert(&full_key, message)?;
                    SaveOutcome::Inserted
                }
            };

            let saved_contact = if outcome != SaveOutcome::Unchanged
                || engine.count_prefix(&contact_prefix(account, &contact))? == 0
            {
                Some(stage_contact_refresh(&engine, &mut batch, account, &contact)?)
            } else {
                None
            };
            if !batch.is_empty() {
                batch.commit()?;
            }
            (outcome, saved_contact)
        };

        match outcome {
            SaveOutcome::Inserted => {
                debug!(id = %message.id, state = %message.state, "message stored");
                if message.is_authored_by(account) {
                    self.fire(EventPayload::MessageSent(message.clone()));
                } else {
                    self.fire(EventPayload::MessageReceived(message.clone()));
                }
            }
            SaveOutcome::StateRaised(previous) => {
                debug!(id = %message.id, from = %previous, to = %message.state, "message state raised");
                self.fire(EventPayload::MessageStateChanged {
                    message: message.clone(),
                    previous,
                });
            }
            SaveOutcome::Unchanged => {}
        }
        if let Some(saved) = saved_contact {
            self.contact_saved(&saved);
        }
        Ok(outcome)
    }

    /// Mark every unread message from `contact` as read
    ///
    /// Returns how many messages changed. The contact is refreshed in the same
    /// commit when anything changed.
    pub fn mark_prev_messages_as_read(
        &self,
        account: &PublicKeyHex,
        contact: &PublicKeyHex,
    ) -> Result<usize> {
        let (count, saved_contact) = {
            let _guard = self.write_guard()?;
            let engine = self.engine()?;
            let mut batch = engine.batch();
            let mut count = 0;
            for key in engine.keys_with_prefix(&conversation_prefix(account, contact))? {
                if !MessageKey::parse(&key)?.is_inbound() {
                    continue;
                }
                if let Some(mut message) = engine.get::<Message>(&key)? {
                    if message.state < MessageState::Read {
                        message.state = MessageState::Read;
                        batch.insert(&key, &message)?;
                        count += 1;
                    }
                }
            }
            if count == 0 {
                return Ok(0);
            }
            let saved = stage_contact_refresh(&engine, &mut batch, account, contact)?;
            batch.commit()?;
            (count, saved)
        };

        debug!(account = %account, contact = %contact, count, "messages marked read");
        self.fire(EventPayload::MessagesStateChanged {
            account: account.clone(),
            contact: contact.clone(),
            count,
        });
        self.contact_saved(&saved_contact);
        Ok(count)
    }

    fn conversation_keys(
        &self,
        account: &PublicKeyHex,
        contact: &PublicKeyHex,
        newest_first: bool,
    ) -> Result<Vec<String>> {
        self.engine()?.prefix_scan_sorted(
            &conversation_prefix(account, contact),
            message_token::CONTACT,
            message_token::CREATED_AT,
            newest_first,
        )
    }
}
