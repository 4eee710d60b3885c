//! Error types for session establishment and the session cipher.

use crate::address::ProtocolAddress;
use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol operations.
///
/// Every error is terminal for the operation that raised it. Persisted
/// session state is left exactly as it was before the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Signed pre-key signature does not verify against the bundle's
    /// identity key.
    #[error("invalid signature")]
    InvalidSignature,

    /// Encrypt or decrypt attempted before a session was established.
    #[error("no session for {0}")]
    NoSession(ProtocolAddress),

    /// The message key for this counter was already consumed.
    #[error("duplicate message")]
    DuplicateMessage,

    /// AEAD authentication failed.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Leading type byte names no known message type.
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),

    /// Message carries a protocol version this build does not speak.
    #[error("unsupported message version {0}")]
    UnsupportedVersion(u8),

    /// Message is truncated or otherwise malformed.
    #[error("invalid message format")]
    InvalidMessage,

    /// Public key has the wrong length or type byte.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Key id outside the medium integer range.
    #[error("key id {0} out of range")]
    InvalidKeyId(u32),

    /// No one-time pre-key with this id is stored.
    #[error("no pre-key with id {0}")]
    InvalidPreKeyId(u32),

    /// No signed pre-key with this id is stored.
    #[error("no signed pre-key with id {0}")]
    InvalidSignedPreKeyId(u32),

    /// A one-time pre-key with this id is already stored.
    #[error("pre-key id {0} already stored")]
    DuplicatePreKeyId(u32),

    /// A signed pre-key with this id is already stored.
    #[error("signed pre-key id {0} already stored")]
    DuplicateSignedPreKeyId(u32),

    /// Remote identity differs from the one previously seen for this address.
    #[error("untrusted identity for {0}")]
    UntrustedIdentity(ProtocolAddress),

    /// Counter jumps further ahead than the skip limit allows.
    #[error("too many skipped messages")]
    TooManySkippedMessages,

    /// Internal cryptographic error
    #[error("cryptographic error")]
    CryptoError,

    /// Storage operation failed
    #[error("storage error")]
    StorageError,

    /// Serialization failed
    #[cfg(feature = "serde")]
    #[error("serialization error")]
    SerializationError,

    /// Deserialization failed
    #[cfg(feature = "serde")]
    #[error("deserialization error")]
    DeserializationError,
}

#[cfg(feature = "serde")]
impl From<bincode::error::EncodeError> for Error {
    fn from(_: bincode::error::EncodeError) -> Self {
        Error::SerializationError
    }
}

#[cfg(feature = "serde")]
impl From<bincode::error::DecodeError> for Error {
    fn from(_: bincode::error::DecodeError) -> Self {
        Error::DeserializationError
    }
}
