//! Cryptographic primitives for peerpost
//!
//! Every account owns a single 32-byte Ed25519 seed. Signing uses Ed25519 directly;
//! encryption and the transport handshake use the X25519 key that is birationally
//! equivalent to the same identity, so one public key names a peer everywhere.

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use crate::errors::{CryptographicError, Result};
use crate::model::{Account, Message};
use crate::types::{PeerId, PublicKeyHex, Timestamp};

// ----------------------------------------------------------------------------
// Identity Key Pair
// ----------------------------------------------------------------------------

/// Ed25519 identity with its derived X25519 agreement key
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    agreement_secret: StaticSecret,
}

impl core::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self::generate_with_rng(&mut rng)
    }

    /// Generate a new identity key pair with custom RNG
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut seed[..]);
        Self::from_bytes(&seed)
    }

    /// Create from a raw 32-byte seed
    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        // Same expanded scalar Ed25519 uses; x25519 clamps it on use.
        let mut expanded = Zeroizing::new([0u8; 64]);
        expanded.copy_from_slice(&Sha512::digest(seed));
        let mut scalar = Zeroizing::new([0u8; 32]);
        scalar.copy_from_slice(&expanded[..32]);
        let agreement_secret = StaticSecret::from(*scalar);

        Self {
            signing_key,
            verifying_key,
            agreement_secret,
        }
    }

    /// Create from the hex seed stored on an [`Account`]
    pub fn from_private_key_hex(private_key: &str) -> Result<Self> {
        let clean = private_key.strip_prefix("0x").unwrap_or(private_key);
        let bytes = Zeroizing::new(
            hex::decode(clean).map_err(|_| CryptographicError::InvalidKeyFormat)?,
        );
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptographicError::InvalidKeyFormat)?;
        Ok(Self::from_bytes(&seed))
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn public_key_hex(&self) -> PublicKeyHex {
        PublicKeyHex::from_bytes(self.verifying_key.as_bytes())
    }

    /// Hex seed, as persisted on the account record
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(self.verifying_key.as_bytes())
    }

    /// X25519 private scalar for Noise and envelope decryption
    pub fn agreement_secret(&self) -> &StaticSecret {
        &self.agreement_secret
    }

    /// X25519 public key matching [`Self::agreement_secret`]
    pub fn agreement_public_bytes(&self) -> [u8; 32] {
        x25519_dalek::PublicKey::from(&self.agreement_secret).to_bytes()
    }

    /// Sign data with flexible input types
    pub fn sign<T: AsRef<[u8]>>(&self, data: T) -> [u8; 64] {
        self.signing_key.sign(data.as_ref()).to_bytes()
    }

    /// Verify a signature from another key with flexible input types
    pub fn verify<D: AsRef<[u8]>>(public_key: &[u8; 32], data: D, signature: &[u8; 64]) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|_| CryptographicError::InvalidKeyFormat)?;
        let signature = Signature::from_bytes(signature);

        verifying_key
            .verify(data.as_ref(), &signature)
            .map_err(|_| CryptographicError::SignatureVerificationFailed.into())
    }

    /// Build a fresh account record for this identity
    pub fn to_account(&self, now: Timestamp) -> Account {
        Account {
            private_key: self.private_key_hex(),
            public_key: self.public_key_hex(),
            chain_address: chain_address(&self.public_key_bytes()),
            created_at: now,
            updated_at: now,
        }
    }
}

// ----------------------------------------------------------------------------
// Key Conversion
// ----------------------------------------------------------------------------

/// Map an Ed25519 public key to its X25519 (Montgomery) form
pub fn edwards_to_montgomery(public_key: &[u8; 32]) -> Result<[u8; 32]> {
    let point = CompressedEdwardsY(*public_key)
        .decompress()
        .ok_or(CryptographicError::InvalidKeyFormat)?;
    Ok(point.to_montgomery().to_bytes())
}

/// Chain address: `0x` followed by the last 20 bytes of SHA-256(public key)
pub fn chain_address(public_key: &[u8; 32]) -> String {
    let hash = Sha256::digest(public_key);
    format!("0x{}", hex::encode(&hash[12..]))
}

// ----------------------------------------------------------------------------
// Message Signatures
// ----------------------------------------------------------------------------

/// Canonical bytes covered by a message signature
fn signing_bytes(message: &Message) -> Result<Vec<u8>> {
    let mut unsigned = message.clone();
    unsigned.signature = Vec::new();
    Ok(bincode::serialize(&unsigned)?)
}

/// Sign `message` in place with `identity`
pub fn sign_message(identity: &IdentityKeyPair, message: &mut Message) -> Result<()> {
    let bytes = signing_bytes(message)?;
    message.signature = identity.sign(bytes).to_vec();
    Ok(())
}

/// Check the detached signature on `message` against `public_key`
pub fn verify_message(public_key: &PublicKeyHex, message: &Message) -> Result<()> {
    if message.signature.is_empty() {
        return Err(CryptographicError::MissingSignature.into());
    }
    let signature: [u8; 64] = message
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| CryptographicError::SignatureVerificationFailed)?;
    let bytes = signing_bytes(message)?;
    IdentityKeyPair::verify(&public_key.to_bytes(), bytes, &signature)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageState;

    fn message_between(a: &IdentityKeyPair, b: &IdentityKeyPair) -> Message {
        Message::new(a.public_key_hex(), b.public_key_hex(), "hello", Timestamp::new(42))
    }

    #[test]
    fn test_identity_round_trip_through_hex() {
        let identity = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_private_key_hex(&identity.private_key_hex()).unwrap();
        assert_eq!(identity.public_key_bytes(), restored.public_key_bytes());
        assert_eq!(identity.agreement_public_bytes(), restored.agreement_public_bytes());

        assert!(IdentityKeyPair::from_private_key_hex("abcd").is_err());
        assert!(IdentityKeyPair::from_private_key_hex("not hex").is_err());
    }

    #[test]
    fn test_agreement_key_matches_montgomery_form() {
        let identity = IdentityKeyPair::generate();
        let converted = edwards_to_montgomery(&identity.public_key_bytes()).unwrap();
        assert_eq!(converted, identity.agreement_public_bytes());
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = IdentityKeyPair::generate();
        let data = b"test message";
        let signature = identity.sign(data);
        assert!(IdentityKeyPair::verify(&identity.public_key_bytes(), data, &signature).is_ok());
        assert!(IdentityKeyPair::verify(&identity.public_key_bytes(), b"other", &signature).is_err());
    }

    #[test]
    fn test_message_signature_covers_every_field() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let mut msg = message_between(&alice, &bob);
        sign_message(&alice, &mut msg).unwrap();
        assert_eq!(msg.signature.len(), 64);
        assert!(verify_message(&alice.public_key_hex(), &msg).is_ok());
        assert!(verify_message(&bob.public_key_hex(), &msg).is_err());

        let mut text_changed = msg.clone();
        text_changed.text.push('!');
        assert!(verify_message(&alice.public_key_hex(), &text_changed).is_err());

        let mut state_changed = msg.clone();
        state_changed.state = MessageState::Read;
        assert!(verify_message(&alice.public_key_hex(), &state_changed).is_err());

        for i in 0..msg.signature.len() {
            let mut flipped = msg.clone();
            flipped.signature[i] ^= 0x01;
            assert!(verify_message(&alice.public_key_hex(), &flipped).is_err());
        }
    }

    #[test]
    fn test_unsigned_message_is_rejected() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let msg = message_between(&alice, &bob);
        assert!(verify_message(&alice.public_key_hex(), &msg).is_err());
    }

    #[test]
    fn test_chain_address_shape() {
        let identity = IdentityKeyPair::generate();
        let account = identity.to_account(Timestamp::new(7));
        assert!(account.chain_address.starts_with("0x"));
        assert_eq!(account.chain_address.len(), 42);
        assert_eq!(account.public_key, identity.public_key_hex());
        assert_eq!(account.created_at, account.updated_at);
    }
}
