//! Message envelope: encryption to a recipient key plus signed message framing
//!
//! Ciphertext layout:
//!
//! ```text
//! [ephemeral X25519 public 32B] [nonce 12B] [ChaCha20-Poly1305 ciphertext + tag]
//! ```
//!
//! The envelope is self-contained: only the recipient's private key is needed to
//! open it. The AEAD key is HKDF-SHA256 over the ephemeral/static shared secret,
//! salted with both public keys, and the ephemeral public key is bound as AAD.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::crypto::{edwards_to_montgomery, sign_message, verify_message, IdentityKeyPair};
use crate::errors::{CryptographicError, PeerpostError, Result};
use crate::model::Message;
use crate::types::{PeerId, PublicKeyHex};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

const ENVELOPE_INFO: &[u8] = b"peerpost-envelope-v1";
const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Smallest possible envelope: header plus an empty AEAD body
pub const MIN_ENVELOPE_LEN: usize = EPHEMERAL_LEN + NONCE_LEN + TAG_LEN;

// ----------------------------------------------------------------------------
// Raw Record Encryption
// ----------------------------------------------------------------------------

fn derive_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
    let mut salt = [0u8; EPHEMERAL_LEN * 2];
    salt[..EPHEMERAL_LEN].copy_from_slice(ephemeral);
    salt[EPHEMERAL_LEN..].copy_from_slice(recipient);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(ENVELOPE_INFO, key.as_mut_slice())
        .map_err(|_| CryptographicError::KeyDerivationFailed)?;
    Ok(key)
}

/// Encrypt `plaintext` so that only the holder of `recipient`'s key can read it
pub fn encrypt_record(recipient: &PublicKeyHex, plaintext: &[u8]) -> Result<Vec<u8>> {
    let recipient_x = PublicKey::from(edwards_to_montgomery(&recipient.to_bytes())?);

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient_x);
    if !shared.was_contributory() {
        return Err(CryptographicError::EncryptionFailed.into());
    }

    let key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient_x.as_bytes())?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: ephemeral_public.as_bytes(),
            },
        )
        .map_err(|_| CryptographicError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
    output.extend_from_slice(ephemeral_public.as_bytes());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt an envelope addressed to `identity`
///
/// A wrong key always fails authentication; it never yields a different record.
pub fn decrypt_record(identity: &IdentityKeyPair, envelope: &[u8]) -> Result<Vec<u8>> {
    if envelope.len() < MIN_ENVELOPE_LEN {
        return Err(CryptographicError::CiphertextTooShort {
            len: envelope.len(),
            min: MIN_ENVELOPE_LEN,
        }
        .into());
    }

    let (ephemeral_bytes, rest) = envelope.split_at(EPHEMERAL_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let mut ephemeral = [0u8; EPHEMERAL_LEN];
    ephemeral.copy_from_slice(ephemeral_bytes);
    let ephemeral_public = PublicKey::from(ephemeral);

    let shared = identity.agreement_secret().diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptographicError::DecryptionFailed.into());
    }

    let key = derive_key(
        shared.as_bytes(),
        &ephemeral,
        &identity.agreement_public_bytes(),
    )?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &ephemeral,
            },
        )
        .map_err(|_| CryptographicError::DecryptionFailed.into())
}

// ----------------------------------------------------------------------------
// Message Envelope
// ----------------------------------------------------------------------------

/// Sign `message` as `identity` and encrypt it to the other side of the conversation
pub fn seal(identity: &IdentityKeyPair, message: &Message) -> Result<Vec<u8>> {
    let local = identity.public_key_hex();
    let counterpart = message.counterpart(&local)?.clone();

    let mut signed = message.clone();
    sign_message(identity, &mut signed)?;
    let plaintext = Zeroizing::new(bincode::serialize(&signed)?);
    encrypt_record(&counterpart, &plaintext)
}

/// Open an envelope received on a connection authenticated as `remote`
///
/// The record must name the local account on one side; the other side must have
/// signed it and must be the peer the connection was authenticated with.
pub fn open(identity: &IdentityKeyPair, envelope: &[u8], remote: &PeerId) -> Result<Message> {
    let plaintext = Zeroizing::new(decrypt_record(identity, envelope)?);
    let message: Message = bincode::deserialize(&plaintext)?;

    let local = identity.public_key_hex();
    let counterpart = message.counterpart(&local)?;
    verify_message(counterpart, &message)?;

    let signer = counterpart.peer_id();
    if &signer != remote {
        debug!(
            message_id = %message.id,
            signer = %signer.short(),
            remote = %remote.short(),
            "envelope signer does not match connection identity"
        );
        return Err(PeerpostError::identity_mismatch(remote.to_string(), signer.to_string()));
    }
    Ok(message)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
