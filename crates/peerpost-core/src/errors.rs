//! Error types for peerpost
//!
//! This module contains every error type used across the workspace, grouped by the
//! layer that produces them: cryptographic errors, storage errors, transport errors
//! and session errors, plus the main [`PeerpostError`] type that unifies them all.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Specific cryptographic error types
#[derive(Debug, thiserror::Error)]
pub enum CryptographicError {
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("Record carries no signature")]
    MissingSignature,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Invalid key format")]
    InvalidKeyFormat,
    #[error("Ciphertext too short: {len} bytes (min: {min})")]
    CiphertextTooShort { len: usize, min: usize },
    #[error("Identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },
}

/// Specific storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Store is not open")]
    NotOpen,
    #[error("Store is already open")]
    AlreadyOpen,
    #[error("Invalid key: {key}")]
    InvalidKey { key: String },
    #[error("Invalid record: {reason}")]
    InvalidRecord { reason: String },
    #[error("Record not found: {what}")]
    NotFound { what: String },
    #[error("Encryption key mismatch: wrong password")]
    EncryptionKeyMismatch,
    #[error("Stored value is corrupted: {reason}")]
    Corrupted { reason: String },
    #[error("Storage engine error: {reason}")]
    Engine { reason: String },
}

/// Specific transport error types
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed to peer {peer_id}: {reason}")]
    ConnectionFailed { peer_id: String, reason: String },
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Malformed frame header: {reason}")]
    MalformedHeader { reason: String },
    #[error("Stream closed by peer {peer_id}")]
    StreamClosed { peer_id: String },
    #[error("Protocol mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: String, actual: String },
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Transport shutdown: {reason}")]
    Shutdown { reason: String },
    #[error("Peer not found: {peer_id}")]
    PeerNotFound { peer_id: String },
    #[error("Authentication failed with peer {peer_id}")]
    AuthenticationFailed { peer_id: String },
}

/// Specific session error types
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No current account is set")]
    AccountNotSet,
    #[error("Session handshake failed with peer {peer_id}: {reason}")]
    HandshakeFailed { peer_id: String, reason: String },
    #[error("Host unavailable: {reason}")]
    HostUnavailable { reason: String },
    #[error("Session supervisor has stopped")]
    SupervisorStopped,
}

/// Core error type for peerpost
#[derive(Debug, thiserror::Error)]
pub enum PeerpostError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptographicError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Channel communication error between runtime tasks
    #[error("Channel error: {message}")]
    Channel { message: String },
}

impl From<std::io::Error> for PeerpostError {
    fn from(err: std::io::Error) -> Self {
        PeerpostError::Transport(TransportError::NetworkIo(err))
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl PeerpostError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        PeerpostError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        PeerpostError::Channel {
            message: message.into(),
        }
    }

    /// Create a signature verification error
    pub fn signature_error() -> Self {
        PeerpostError::Crypto(CryptographicError::SignatureVerificationFailed)
    }

    /// Create an invalid record error
    pub fn invalid_record<T: Into<String>>(reason: T) -> Self {
        PeerpostError::Storage(StorageError::InvalidRecord {
            reason: reason.into(),
        })
    }

    /// Create a storage engine error
    pub fn engine_error<T: Into<String>>(reason: T) -> Self {
        PeerpostError::Storage(StorageError::Engine {
            reason: reason.into(),
        })
    }

    /// Create a transport connection failed error
    pub fn connection_failed<P: Into<String>, R: Into<String>>(peer_id: P, reason: R) -> Self {
        PeerpostError::Transport(TransportError::ConnectionFailed {
            peer_id: peer_id.into(),
            reason: reason.into(),
        })
    }

    /// Create a handshake failed error
    pub fn handshake_failed<P: Into<String>, R: Into<String>>(peer_id: P, reason: R) -> Self {
        PeerpostError::Session(SessionError::HandshakeFailed {
            peer_id: peer_id.into(),
            reason: reason.into(),
        })
    }

    /// Create an identity mismatch error
    pub fn identity_mismatch<E: Into<String>, A: Into<String>>(expected: E, actual: A) -> Self {
        PeerpostError::Crypto(CryptographicError::IdentityMismatch {
            expected: expected.into(),
            actual: actual.into(),
        })
    }

    /// Errors that end a stream's read or write loop.
    ///
    /// Everything else (a bad signature, a record that will not decode, a
    /// failed store write) only costs the message at hand.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(self, PeerpostError::Transport(_) | PeerpostError::Noise(_))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, PeerpostError>;
pub type PeerpostResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_fatal_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(PeerpostError::from(io).is_stream_fatal());
        assert!(!PeerpostError::signature_error().is_stream_fatal());
        assert!(!PeerpostError::invalid_record("empty id").is_stream_fatal());
    }
}
