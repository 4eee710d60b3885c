//! Key material with memory safety guarantees.
//!
//! X25519 key pairs serve both key agreement and, through XEdDSA, signing.
//! Secret halves zeroize on drop and are redacted from `Debug` output.

use crate::{
    crypto::KEY_SIZE_32,
    error::{Error, Result},
    xeddsa::{SIGNATURE_LENGTH, XEdDSAPrivateKey, XEdDSAPublicKey},
};
use rand_core::CryptoRngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Type byte prefixed to serialized Curve25519 public keys.
pub const DJB_TYPE: u8 = 0x05;

/// Upper bound (exclusive) of the medium integer space used for key ids.
pub const MEDIUM_MAX_VALUE: u32 = 0x00FF_FFFF;

/// Largest registration id handed out by [`generate_registration_id`].
pub const MAX_REGISTRATION_ID: u32 = 16380;

/// X25519 public key (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE_32]);

impl PublicKey {
    /// Size in bytes
    pub const SIZE: usize = KEY_SIZE_32;

    /// Size of the serialized form (type byte + key)
    pub const SERIALIZED_SIZE: usize = KEY_SIZE_32 + 1;

    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }

    /// Serializes as `DJB_TYPE || key`.
    #[must_use]
    pub fn serialize(&self) -> [u8; Self::SERIALIZED_SIZE] {
        let mut out = [0u8; Self::SERIALIZED_SIZE];
        out[0] = DJB_TYPE;
        out[1..].copy_from_slice(&self.0);
        out
    }

    /// Parses the form produced by [`PublicKey::serialize`].
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        match bytes.split_first() {
            Some((&DJB_TYPE, key)) if key.len() == KEY_SIZE_32 => Ok(Self(
                key.try_into().map_err(|_| Error::InvalidPublicKey)?,
            )),
            _ => Err(Error::InvalidPublicKey),
        }
    }

    /// Verifies an XEdDSA signature made by the owner of this key.
    ///
    /// Any failure, including a key that has no Edwards form, is reported
    /// as `InvalidSignature`.
    pub fn verify_signature(
        &self,
        message: &[u8],
        signature: &[u8; SIGNATURE_LENGTH],
    ) -> Result<()> {
        XEdDSAPublicKey::from_x25519_public(self)
            .and_then(|public| public.verify(message, signature))
            .map_err(|_| Error::InvalidSignature)
    }

    /// Convert to X25519 public key
    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey([REDACTED])")
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(pk: X25519PublicKey) -> Self {
        Self(*pk.as_bytes())
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(secret: &StaticSecret) -> Self {
        PublicKey::from(X25519PublicKey::from(secret))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde::Serialize::serialize(&self.0, serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = <[u8; 32] as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Self::from_bytes(bytes))
    }
}

/// X25519 secret key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    /// Generate a new random secret key
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self(StaticSecret::random_from_rng(rng))
    }

    /// Create from raw bytes (must be 32 bytes)
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Get the corresponding public key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.0)
    }

    /// Perform Diffie-Hellman key agreement
    #[must_use]
    pub fn diffie_hellman(&self, public: &PublicKey) -> DhOutput {
        let shared = self.0.diffie_hellman(&public.to_x25519());
        DhOutput(*shared.as_bytes())
    }

    pub(crate) fn to_bytes(&self) -> Zeroizing<[u8; KEY_SIZE_32]> {
        Zeroizing::new(self.0.to_bytes())
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// Output of Diffie-Hellman operation (32 bytes)
/// Automatically zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhOutput(pub(crate) [u8; KEY_SIZE_32]);

impl DhOutput {
    /// Returns a byte slice of the Diffie-Hellman operation output
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }
}

impl std::fmt::Debug for DhOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhOutput([REDACTED])")
    }
}

/// X25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    public: PublicKey,
    secret: SecretKey,
}

impl KeyPair {
    /// Generate a fresh key pair
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self::from_secret(SecretKey::generate(rng))
    }

    #[must_use]
    pub fn from_secret(secret: SecretKey) -> Self {
        Self {
            public: secret.public_key(),
            secret,
        }
    }

    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Diffie-Hellman with the secret half of this pair.
    #[must_use]
    pub fn diffie_hellman(&self, public: &PublicKey) -> DhOutput {
        self.secret.diffie_hellman(public)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Long-term identity key pair.
///
/// A single X25519 key used for X3DH and, via XEdDSA, for signing
/// pre-keys.
#[derive(Debug, Clone)]
pub struct IdentityKeyPair {
    key_pair: KeyPair,
}

impl IdentityKeyPair {
    /// Generate a new identity key pair
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self {
            key_pair: KeyPair::generate(rng),
        }
    }

    /// Get the public identity key
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        self.key_pair.public_key()
    }

    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        self.key_pair.secret_key()
    }

    /// Signs `message` with XEdDSA.
    ///
    /// The 64-byte nonce input is drawn from `rng`, so signing the same
    /// message twice yields different signatures.
    pub fn sign<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        message: &[u8],
    ) -> Result<[u8; SIGNATURE_LENGTH]> {
        let private = XEdDSAPrivateKey::from_x25519_private(&self.secret_key().to_bytes())?;

        let mut random = Zeroizing::new([0u8; 64]);
        rng.fill_bytes(random.as_mut());

        Ok(private.sign(message, &random))
    }
}

/// Generates a per-device registration id in `1..=MAX_REGISTRATION_ID`.
///
/// Uniqueness is advisory only.
pub fn generate_registration_id<R: CryptoRngCore>(rng: &mut R) -> u32 {
    1 + rng.next_u32() % MAX_REGISTRATION_ID
}

/// Generates a pre-key id in `1..MEDIUM_MAX_VALUE`.
pub fn generate_pre_key_id<R: CryptoRngCore>(rng: &mut R) -> u32 {
    1 + rng.next_u32() % (MEDIUM_MAX_VALUE - 1)
}

/// Rejects key ids outside the medium integer range.
pub fn check_pre_key_id(id: u32) -> Result<u32> {
    if id < MEDIUM_MAX_VALUE {
        Ok(id)
    } else {
        Err(Error::InvalidKeyId(id))
    }
}
