//! Contact records, newest `updated_at` first per account

use tracing::debug;

use peerpost_core::{Contact, EventPayload, PublicKeyHex, Result, Timestamp};

use crate::engine::{RecordBatch, StorageEngine};
use crate::keys::{
    contact_key, contact_prefix, contact_token, contacts_prefix, conversation_prefix, ContactKey,
};
use crate::store::{page, RecordStore};

impl RecordStore {
    /// One page of `account`'s contacts, most recently updated first
    pub fn contacts(
        &self,
        account: &PublicKeyHex,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Contact>> {
        let engine = self.engine()?;
        let keys = engine.prefix_scan_sorted(
            &contacts_prefix(account),
            contact_token::ACCOUNT,
            contact_token::UPDATED_AT,
            true,
        )?;
        let mut contacts = Vec::new();
        for key in page(keys, offset, limit) {
            if let Some(contact) = engine.get::<Contact>(&key)? {
                contacts.push(contact);
            }
        }
        Ok(contacts)
    }

    pub fn contacts_count(&self, account: &PublicKeyHex) -> Result<usize> {
        self.engine()?.count_prefix(&contacts_prefix(account))
    }

    /// The stored copy of one contact, if any
    pub fn contact(&self, account: &PublicKeyHex, contact: &PublicKeyHex) -> Result<Option<Contact>> {
        let engine = self.engine()?;
        let keys = engine.prefix_scan_sorted(
            &contact_prefix(account, contact),
            contact_token::CONTACT,
            contact_token::UPDATED_AT,
            true,
        )?;
        match keys.first() {
            Some(key) => engine.get(key),
            None => Ok(None),
        }
    }

    /// Insert or refresh `contact`, keeping the first stored `created_at`
    pub fn add_update_contact(&self, contact: &mut Contact) -> Result<()> {
        {
            let _guard = self.write_guard()?;
            let engine = self.engine()?;
            let mut batch = engine.batch();
            stage_contact(&engine, &mut batch, contact)?;
            batch.commit()?;
        }
        self.contact_saved(contact);
        Ok(())
    }

    pub(crate) fn contact_saved(&self, contact: &Contact) {
        debug!(
            account = %contact.account_public_key,
            contact = %contact.public_key,
            "contact saved"
        );
        self.fire(EventPayload::ContactSaved(contact.clone()));
    }

    /// Delete contacts of `account` together with their conversations
    ///
    /// Returns the number of removed keys.
    pub fn delete_contacts(&self, account: &PublicKeyHex, contacts: &[PublicKeyHex]) -> Result<usize> {
        if contacts.is_empty() {
            return Ok(0);
        }
        let removed = {
            let _guard = self.write_guard()?;
            let engine = self.engine()?;
            let mut batch = engine.batch();
            let mut removed = 0;
            for contact in contacts {
                let prefixes = [
                    contact_prefix(account, contact),
                    conversation_prefix(account, contact),
                ];
                for prefix in &prefixes {
                    for key in engine.keys_with_prefix(prefix)? {
                        batch.remove(&key);
                        removed += 1;
                    }
                }
            }
            batch.commit()?;
            removed
        };

        if removed > 0 {
            debug!(account = %account, keys = removed, "contacts deleted");
            self.fire(EventPayload::ContactsChanged {
                account: account.clone(),
            });
        }
        Ok(removed)
    }
}

// ----------------------------------------------------------------------------
// Staging
// ----------------------------------------------------------------------------

/// Stage the upsert of `contact` into `batch`
///
/// Every stored copy of the contact is removed and the new key sorts before all
/// other contacts of the account. The caller must hold the store's write guard.
pub(crate) fn stage_contact(
    engine: &StorageEngine,
    batch: &mut RecordBatch<'_>,
    contact: &mut Contact,
) -> Result<()> {
    let mut stale = Vec::new();
    let mut oldest: Option<Timestamp> = None;
    let mut newest = Timestamp::default();
    for key in engine.keys_with_prefix(&contacts_prefix(&contact.account_public_key))? {
        let parsed = ContactKey::parse(&key)?;
        newest = newest.max(parsed.updated_at);
        if parsed.contact == contact.public_key {
            oldest = Some(oldest.map_or(parsed.created_at, |t| t.min(parsed.created_at)));
            stale.push(key);
        }
    }

    let now = Timestamp::now();
    contact.created_at = match oldest {
        Some(created_at) => created_at,
        None if contact.created_at.is_unset() => now,
        None => contact.created_at,
    };
    // Strictly newer than every other contact of the account so it sorts first.
    contact.updated_at = now
        .max(Timestamp::new(newest.as_nanos().saturating_add(1)))
        .max(contact.created_at);
    contact.validate()?;

    for key in &stale {
        batch.remove(key);
    }
    batch.insert(&contact_key(contact)?, contact)
}

/// Stage a refresh of the contact `contact` of `account`, creating it if unknown
pub(crate) fn stage_contact_refresh(
    engine: &StorageEngine,
    batch: &mut RecordBatch<'_>,
    account: &PublicKeyHex,
    contact: &PublicKeyHex,
) -> Result<Contact> {
    let keys = engine.prefix_scan_sorted(
        &contact_prefix(account, contact),
        contact_token::CONTACT,
        contact_token::UPDATED_AT,
        true,
    )?;
    let stored = match keys.first() {
        Some(key) => engine.get::<Contact>(key)?,
        None => None,
    };
    let mut refreshed = stored.unwrap_or_else(|| Contact::new(account.clone(), contact.clone()));
    stage_contact(engine, batch, &mut refreshed)?;
    Ok(refreshed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerpost_core::{EventBroker, StoreConfig, Topic};

    fn open_store() -> RecordStore {
        let store = RecordStore::new(StoreConfig::testing(), EventBroker::default());
        store.open_temporary("pw").unwrap();
        store
    }

    fn pk(byte: u8) -> PublicKeyHex {
        PublicKeyHex::from_bytes(&[byte; 32])
    }

    #[test]
    fn test_update_keeps_single_copy_and_created_at() {
        let store = open_store();
        let mut contact = Contact::new(pk(1), pk(2));
        store.add_update_contact(&mut contact).unwrap();
        let created = contact.created_at;

        let mut refreshed = Contact::new(pk(1), pk(2));
        refreshed.identified = true;
        store.add_update_contact(&mut refreshed).unwrap();

        assert_eq!(store.contacts_count(&pk(1)).unwrap(), 1);
        let stored = store.contact(&pk(1), &pk(2)).unwrap().unwrap();
        assert_eq!(stored.created_at, created);
        assert!(stored.identified);
        assert!(stored.updated_at >= created);
    }

    #[test]
    fn test_contacts_sorted_and_paged() {
        let store = open_store();
        for byte in 2..6 {
            store.add_update_contact(&mut Contact::new(pk(1), pk(byte))).unwrap();
        }
        // Touching the first contact again moves it to the front.
        store.add_update_contact(&mut Contact::new(pk(1), pk(2))).unwrap();

        let all = store.contacts(&pk(1), 0, 10).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].public_key, pk(2));
        assert_eq!(store.contacts(&pk(1), 1, 2).unwrap().len(), 2);
        assert!(store.contacts(&pk(1), 4, 10).unwrap().is_empty());
        assert!(store.contacts(&pk(9), 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_self_contact_rejected() {
        let store = open_store();
        assert!(store.add_update_contact(&mut Contact::new(pk(1), pk(1))).is_err());
    }

    #[test]
    fn test_delete_contacts_event() {
        let store = open_store();
        let mut sub = store.broker().subscribe(&[Topic::ContactsChanged]);
        store.add_update_contact(&mut Contact::new(pk(1), pk(2))).unwrap();
        store.add_update_contact(&mut Contact::new(pk(3), pk(2))).unwrap();

        assert_eq!(store.delete_contacts(&pk(1), &[pk(2)]).unwrap(), 1);
        assert!(sub.try_recv().is_some());
        assert_eq!(store.contacts_count(&pk(3)).unwrap(), 1);

        assert_eq!(store.delete_contacts(&pk(1), &[pk(2)]).unwrap(), 0);
        assert!(sub.try_recv().is_none());
    }
}
