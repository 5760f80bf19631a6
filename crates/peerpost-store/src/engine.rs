//! Storage engine: sled lifecycle, value encryption and key scans
//!
//! The [`StorageEngine`] owns the sled database and the value key. Values are
//! bincode-encoded and sealed with ChaCha20-Poly1305 under a key derived from the
//! store password with Argon2id:
//!
//! ```text
//! [nonce 12B] [ciphertext + tag]
//! ```
//!
//! Keys are stored in the clear so that prefix scans stay possible. A sealed
//! sentinel in the `meta` tree lets a wrong password be detected on open.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand_core::{OsRng, RngCore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use peerpost_core::{CryptographicError, PeerpostError, Result, StorageError, StoreConfig};

use crate::keys::{scan_prefix, split_key};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

const RECORDS_TREE: &str = "records";
const META_TREE: &str = "meta";
const META_SALT: &[u8] = b"kdf-salt";
const META_CHECK: &[u8] = b"password-check";
const CHECK_PLAINTEXT: &[u8] = b"peerpost-store-v1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub(crate) fn engine_error(err: sled::Error) -> PeerpostError {
    PeerpostError::engine_error(err.to_string())
}

// ----------------------------------------------------------------------------
// Value Cipher
// ----------------------------------------------------------------------------

/// Password-derived value key, zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
struct ValueKey([u8; 32]);

impl ValueKey {
    fn derive(password: &[u8], salt: &[u8], config: &StoreConfig) -> Result<Self> {
        let params = Params::new(
            config.kdf_memory_kib,
            config.kdf_iterations,
            config.kdf_parallelism,
            Some(32),
        )
        .map_err(|e| PeerpostError::config_error(format!("invalid Argon2 parameters: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut output = [0u8; 32];
        argon2
            .hash_password_into(password, salt, &mut output)
            .map_err(|_| CryptographicError::KeyDerivationFailed)?;
        Ok(Self(output))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptographicError::EncryptionFailed)?;

        let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(StorageError::Corrupted {
                reason: format!("sealed value is only {} bytes", sealed.len()),
            }
            .into());
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptographicError::DecryptionFailed.into())
    }
}

// ----------------------------------------------------------------------------
// Write Batch
// ----------------------------------------------------------------------------

/// A set of removals and sealed inserts committed atomically
pub struct RecordBatch<'a> {
    engine: &'a StorageEngine,
    batch: sled::Batch,
    removed: usize,
    inserted: usize,
}

impl<'a> RecordBatch<'a> {
    pub fn remove(&mut self, key: &str) {
        self.batch.remove(key.as_bytes());
        self.removed += 1;
    }

    pub fn insert<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let sealed = self.engine.seal_value(value)?;
        self.batch.insert(key.as_bytes(), sealed);
        self.inserted += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.removed == 0 && self.inserted == 0
    }

    /// Apply every staged operation in one atomic step
    pub fn commit(self) -> Result<()> {
        debug!(removed = self.removed, inserted = self.inserted, "committing record batch");
        self.engine
            .records
            .apply_batch(self.batch)
            .map_err(engine_error)
    }
}

// ----------------------------------------------------------------------------
// StorageEngine
// ----------------------------------------------------------------------------

/// Encrypted record engine backed by sled
pub struct StorageEngine {
    db: sled::Db,
    records: sled::Tree,
    key: ValueKey,
}

impl StorageEngine {
    /// Open (or create) the database described by `config`
    pub fn open(config: &StoreConfig, password: &str) -> Result<Self> {
        let db = sled::Config::new()
            .path(&config.path)
            .open()
            .map_err(engine_error)?;
        info!(path = %config.path.display(), "opened record database");
        Self::from_db(db, config, password)
    }

    /// Open a throwaway database that is removed when dropped
    pub fn open_temporary(config: &StoreConfig, password: &str) -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(engine_error)?;
        Self::from_db(db, config, password)
    }

    fn from_db(db: sled::Db, config: &StoreConfig, password: &str) -> Result<Self> {
        if password.trim().is_empty() {
            return Err(PeerpostError::config_error("password cannot be empty"));
        }
        let meta = db.open_tree(META_TREE).map_err(engine_error)?;
        let records = db.open_tree(RECORDS_TREE).map_err(engine_error)?;

        let salt = match meta.get(META_SALT).map_err(engine_error)? {
            Some(salt) => salt.to_vec(),
            None => {
                let mut salt = vec![0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                meta.insert(META_SALT, salt.as_slice()).map_err(engine_error)?;
                salt
            }
        };
        let key = ValueKey::derive(password.as_bytes(), &salt, config)?;

        match meta.get(META_CHECK).map_err(engine_error)? {
            Some(check) => {
                let plaintext = key
                    .open(&check)
                    .map_err(|_| StorageError::EncryptionKeyMismatch)?;
                if plaintext != CHECK_PLAINTEXT {
                    return Err(StorageError::EncryptionKeyMismatch.into());
                }
            }
            None => {
                let check = key.seal(CHECK_PLAINTEXT)?;
                meta.insert(META_CHECK, check).map_err(engine_error)?;
            }
        }
        meta.flush().map_err(engine_error)?;

        Ok(Self { db, records, key })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(engine_error)?;
        Ok(())
    }

    pub fn batch(&self) -> RecordBatch<'_> {
        RecordBatch {
            engine: self,
            batch: sled::Batch::default(),
            removed: 0,
            inserted: 0,
        }
    }

    fn seal_value<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let plaintext = zeroize::Zeroizing::new(bincode::serialize(value)?);
        self.key.seal(&plaintext)
    }

    /// Fetch and decrypt the value under `key`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.records.get(key.as_bytes()).map_err(engine_error)? {
            None => Ok(None),
            Some(sealed) => {
                let plaintext = zeroize::Zeroizing::new(self.key.open(&sealed)?);
                let value = bincode::deserialize(&plaintext).map_err(|e| StorageError::Corrupted {
                    reason: format!("{key}: {e}"),
                })?;
                Ok(Some(value))
            }
        }
    }

    /// Every stored key starting with `prefix`, in byte order
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.records.scan_prefix(prefix.as_bytes()).keys() {
            let key = item.map_err(engine_error)?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    /// Number of stored keys starting with `prefix`
    pub fn count_prefix(&self, prefix: &str) -> Result<usize> {
        let mut count = 0;
        for item in self.records.scan_prefix(prefix.as_bytes()).keys() {
            item.map_err(engine_error)?;
            count += 1;
        }
        Ok(count)
    }

    /// Every stored key
    pub fn all_keys(&self) -> Result<Vec<String>> {
        self.keys_with_prefix("")
    }

    /// Keys sharing the first `position + 1` tokens of `prefix_or_full_key`
    pub fn prefix_scan(&self, prefix_or_full_key: &str, position: usize) -> Result<Vec<String>> {
        let prefix = scan_prefix(prefix_or_full_key, position)?;
        self.keys_with_prefix(&prefix)
    }

    /// [`Self::prefix_scan`] ordered by the token at `sort_position`
    pub fn prefix_scan_sorted(
        &self,
        prefix_or_full_key: &str,
        position: usize,
        sort_position: usize,
        descending: bool,
    ) -> Result<Vec<String>> {
        let mut keys = self.prefix_scan(prefix_or_full_key, position)?;
        if let Some(first) = keys.first() {
            if split_key(first).len() <= sort_position {
                return Err(StorageError::InvalidKey { key: first.clone() }.into());
            }
        }
        // Stable sort on the chosen token keeps byte order among equal tokens.
        keys.sort_by(|a, b| {
            let left = split_key(a).get(sort_position).copied().unwrap_or_default();
            let right = split_key(b).get(sort_position).copied().unwrap_or_default();
            if descending {
                right.cmp(left)
            } else {
                left.cmp(right)
            }
        });
        Ok(keys)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> StorageEngine {
        StorageEngine::open_temporary(&StoreConfig::testing(), "hunter2").unwrap()
    }

    #[test]
    fn test_value_round_trip_is_encrypted() {
        let engine = engine();
        let mut batch = engine.batch();
        batch.insert("k[]1", &"visible?".to_string()).unwrap();
        batch.commit().unwrap();

        let raw = engine.records.get(b"k[]1").unwrap().unwrap();
        assert!(!raw.windows(8).any(|w| w == b"visible?"));
        assert_eq!(engine.get::<String>("k[]1").unwrap().unwrap(), "visible?");
        assert!(engine.get::<String>("k[]2").unwrap().is_none());
    }

    #[test]
    fn test_batch_is_atomic_remove_then_insert() {
        let engine = engine();
        let mut batch = engine.batch();
        batch.insert("a[]old", &1u32).unwrap();
        batch.commit().unwrap();

        let mut batch = engine.batch();
        batch.remove("a[]old");
        batch.insert("a[]new", &2u32).unwrap();
        assert!(!batch.is_empty());
        batch.commit().unwrap();

        assert_eq!(engine.all_keys().unwrap(), vec!["a[]new".to_string()]);
    }

    #[test]
    fn test_sorted_scan() {
        let engine = engine();
        let mut batch = engine.batch();
        for (key, value) in [("m[]x[]003", 3u8), ("m[]x[]001", 1), ("m[]y[]002", 2), ("m[]x[]002", 2)] {
            batch.insert(key, &value).unwrap();
        }
        batch.commit().unwrap();

        let asc = engine.prefix_scan_sorted("m[]x[]999", 1, 2, false).unwrap();
        assert_eq!(asc, vec!["m[]x[]001", "m[]x[]002", "m[]x[]003"]);
        let desc = engine.prefix_scan_sorted("m[]x", 1, 2, true).unwrap();
        assert_eq!(desc, vec!["m[]x[]003", "m[]x[]002", "m[]x[]001"]);
        assert!(engine.prefix_scan_sorted("m[]x", 1, 7, true).is_err());
        assert_eq!(engine.count_prefix("m[]").unwrap(), 4);
    }

    #[test]
    fn test_wrong_password_detected_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::testing().with_path(dir.path().join("db"));
        {
            let engine = StorageEngine::open(&config, "correct horse").unwrap();
            engine.flush().unwrap();
        }
        let err = StorageEngine::open(&config, "battery staple").err().unwrap();
        assert!(matches!(
            err,
            PeerpostError::Storage(StorageError::EncryptionKeyMismatch)
        ));
        assert!(StorageEngine::open(&config, "correct horse").is_ok());
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(StorageEngine::open_temporary(&StoreConfig::testing(), "  ").is_err());
    }
}
