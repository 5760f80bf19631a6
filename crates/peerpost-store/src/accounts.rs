//! Account records
//!
//! Accounts are ordered newest-first by `updated_at`; the first one is the current
//! account. Re-saving an account bumps its `updated_at` and so makes it current.

use tracing::{debug, info};

use peerpost_core::{
    Account, EventPayload, IdentityKeyPair, PeerpostError, PublicKeyHex, Result, StorageError,
    Timestamp,
};

use crate::keys::{account_key, account_token, accounts_prefix, has_component, AccountKey};
use crate::store::RecordStore;

impl RecordStore {
    /// All accounts, newest `updated_at` first
    pub fn accounts(&self) -> Result<Vec<Account>> {
        let engine = self.engine()?;
        let keys =
            engine.prefix_scan_sorted(&accounts_prefix(), 0, account_token::UPDATED_AT, true)?;
        let mut accounts = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(account) = engine.get::<Account>(&key)? {
                accounts.push(account);
            }
        }
        Ok(accounts)
    }

    /// The current account
    pub fn account(&self) -> Result<Account> {
        self.current_account()?.ok_or_else(|| {
            StorageError::NotFound {
                what: "current account".into(),
            }
            .into()
        })
    }

    /// The current account, or `None` when no account exists yet
    pub fn current_account(&self) -> Result<Option<Account>> {
        Ok(self.accounts()?.into_iter().next())
    }

    pub fn account_exists(&self, public_key: &PublicKeyHex) -> Result<bool> {
        let engine = self.engine()?;
        Ok(engine
            .keys_with_prefix(&accounts_prefix())?
            .iter()
            .filter_map(|key| AccountKey::parse(key).ok())
            .any(|parsed| &parsed.public_key == public_key))
    }

    /// Save `account` as the current account
    ///
    /// Stale keys of the same account are replaced in one batch. `created_at` is
    /// kept from the stored copy when present; `updated_at` always moves past every
    /// other account so the saved one sorts first.
    pub fn add_update_account(&self, account: &mut Account) -> Result<()> {
        let identity = IdentityKeyPair::from_private_key_hex(&account.private_key)?;
        if identity.public_key_hex() != account.public_key {
            return Err(PeerpostError::invalid_record(
                "account public key does not match its private key",
            ));
        }

        let previous = {
            let _guard = self.write_guard()?;
            let engine = self.engine()?;
            let previous = self.current_account()?;

            let mut stale = Vec::new();
            let mut newest = Timestamp::default();
            for key in engine.keys_with_prefix(&accounts_prefix())? {
                let parsed = AccountKey::parse(&key)?;
                newest = newest.max(parsed.updated_at);
                if parsed.public_key == account.public_key {
                    if account.created_at.is_unset() {
                        account.created_at = parsed.created_at;
                    }
                    stale.push(key);
                }
            }

            let now = Timestamp::now();
            account.updated_at = now.max(Timestamp::new(newest.as_nanos().saturating_add(1)));
            if account.created_at.is_unset() {
                account.created_at = account.updated_at;
            }
            account.validate()?;

            let mut batch = engine.batch();
            for key in &stale {
                batch.remove(key);
            }
            batch.insert(&account_key(account)?, account)?;
            batch.commit()?;
            previous
        };

        debug!(account = %account.public_key, "account saved");
        self.fire(EventPayload::AccountsChanged);
        let previous_key = previous.map(|a| a.public_key);
        if previous_key.as_ref() != Some(&account.public_key) {
            info!(account = %account.public_key, "current account changed");
            self.fire(EventPayload::CurrentAccountChanged {
                previous: previous_key,
                current: Some(account.public_key.clone()),
            });
        }
        Ok(())
    }

    /// Import an account from its hex private key and make it current
    pub fn create_account(&self, private_key_hex: &str) -> Result<Account> {
        if private_key_hex.trim().is_empty() {
            return Err(PeerpostError::invalid_record("private key is empty"));
        }
        self.engine()?;
        let identity = IdentityKeyPair::from_private_key_hex(private_key_hex.trim())?;
        let mut account = identity.to_account(Timestamp::default());
        self.add_update_account(&mut account)?;
        Ok(account)
    }

    /// Generate a fresh identity and make it the current account
    pub fn auto_create_account(&self) -> Result<Account> {
        self.engine()?;
        let identity = IdentityKeyPair::generate();
        let mut account = identity.to_account(Timestamp::default());
        self.add_update_account(&mut account)?;
        Ok(account)
    }

    /// Delete accounts together with every contact and message they own
    pub fn delete_accounts(&self, accounts: &[PublicKeyHex]) -> Result<usize> {
        if accounts.is_empty() {
            return Ok(0);
        }
        let (removed, previous, current) = {
            let _guard = self.write_guard()?;
            let engine = self.engine()?;
            let previous = self.current_account()?.map(|a| a.public_key);

            let mut batch = engine.batch();
            let mut removed = 0;
            for key in engine.all_keys()? {
                if accounts.iter().any(|pk| has_component(&key, pk.as_str())) {
                    batch.remove(&key);
                    removed += 1;
                }
            }
            batch.commit()?;
            let current = self.current_account()?.map(|a| a.public_key);
            (removed, previous, current)
        };

        info!(accounts = accounts.len(), keys = removed, "accounts deleted");
        self.fire(EventPayload::AccountsChanged);
        if previous != current {
            self.fire(EventPayload::CurrentAccountChanged { previous, current });
        }
        Ok(removed)
    }
}
