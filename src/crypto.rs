//! Cryptographic primitives for the handshake and the session ratchet.
//!
//! Provides key derivation functions (KDF), AEAD encryption/decryption,
//! and symmetric key management with automatic zeroization.

use crate::error::{Error, Result};
use crate::keys::DhOutput;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

const X3DH_INFO: &[u8] = b"HaloE2E_X3DH_v1";
const ROOT_INFO: &[u8] = b"HaloE2E_Ratchet_Root";

pub const KEY_SIZE_32: usize = 32;
pub const KEY_SIZE_64: usize = 64;
pub const TAG_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// 256-bit symmetric key with automatic zeroization on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE_32]);

impl SymmetricKey {
    /// Creates a symmetric key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    /// Returns the key as a byte array reference.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }

    fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(bytes.try_into().map_err(|_| Error::CryptoError)?))
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// X3DH key derivation.
///
/// Computes `SK = HKDF(F || DH1 || DH2 || DH3 || [DH4])` where:
/// - `F = 0xFF^32` (domain separation constant for X25519/XEdDSA)
/// - `salt = 0x00^32`
/// - Output length is 32 bytes
///
/// `dh4` is present only when the handshake used a one-time pre-key.
pub fn derive_x3dh_secret(
    dh1: &DhOutput,
    dh2: &DhOutput,
    dh3: &DhOutput,
    dh4: Option<&DhOutput>,
) -> Result<SymmetricKey> {
    const F: [u8; 32] = [0xFF; 32];

    let mut ikm = [0u8; 32 + 32 * 4]; // F + 4 DH outputs
    let mut len = 0;

    for part in [&F, dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()] {
        ikm[len..len + 32].copy_from_slice(part);
        len += 32;
    }

    if let Some(dh4) = dh4 {
        ikm[len..len + 32].copy_from_slice(dh4.as_bytes());
        len += 32;
    }

    let salt = [0u8; 32];
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm[..len]);

    let mut output = [0u8; KEY_SIZE_32];
    let expanded = hkdf.expand(X3DH_INFO, &mut output);
    ikm.zeroize();
    expanded.map_err(|_| Error::CryptoError)?;

    Ok(SymmetricKey(output))
}

/// Root KDF for a DH ratchet step.
///
/// Computes `(RK', CK) = KDF_RK(RK, DH_out)`: HKDF-SHA256 salted with the
/// current root key, first half of the output is the new root key and the
/// second half the new chain key.
pub fn kdf_root(
    root_key: &SymmetricKey,
    dh_output: &DhOutput,
) -> Result<(SymmetricKey, SymmetricKey)> {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output.as_bytes());

    let mut output = [0u8; KEY_SIZE_64];
    let expanded = hkdf.expand(ROOT_INFO, &mut output);
    let keys = expanded.map_err(|_| Error::CryptoError).and_then(|()| {
        Ok((
            SymmetricKey::from_slice(&output[..KEY_SIZE_32])?,
            SymmetricKey::from_slice(&output[KEY_SIZE_32..])?,
        ))
    });

    output.zeroize();
    keys
}

/// Chain KDF for the symmetric ratchet step.
///
/// Computes `(CK', MK) = KDF_CK(CK)` where:
/// - `MK = HMAC(CK, 0x01)` is the message key
/// - `CK' = HMAC(CK, 0x02)` is the new chain key
///
/// Returns `(new_chain_key, message_key)`.
pub fn kdf_chain(chain_key: &SymmetricKey) -> Result<(SymmetricKey, SymmetricKey)> {
    let message_key = hmac_step(chain_key, 0x01)?;
    let new_chain_key = hmac_step(chain_key, 0x02)?;
    Ok((new_chain_key, message_key))
}

fn hmac_step(chain_key: &SymmetricKey, constant: u8) -> Result<SymmetricKey> {
    let mut mac =
        HmacSha256::new_from_slice(chain_key.as_bytes()).map_err(|_| Error::CryptoError)?;
    mac.update(&[constant]);
    Ok(SymmetricKey(mac.finalize().into_bytes().into()))
}

/// Encrypts a message using ChaCha20-Poly1305 AEAD.
///
/// Returns ciphertext with the 16-byte authentication tag appended. The
/// nonce must be unique per key; every message key here is used once.
pub fn encrypt(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    use chacha20poly1305::{
        ChaCha20Poly1305, Key, KeyInit, Nonce,
        aead::{Aead, Payload},
    };

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let payload = Payload {
        msg: plaintext,
        aad: associated_data,
    };

    cipher
        .encrypt(Nonce::from_slice(nonce), payload)
        .map_err(|_| Error::CryptoError)
}

/// Decrypts a message using ChaCha20-Poly1305 AEAD.
///
/// The tag is checked in constant time before any plaintext is released.
///
/// # Errors
/// Returns `Error::DecryptionFailed` for a wrong key, tampered ciphertext or
/// mismatched associated data, without saying which.
pub fn decrypt(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    use chacha20poly1305::{
        ChaCha20Poly1305, Key, KeyInit, Nonce,
        aead::{Aead, Payload},
    };

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let payload = Payload {
        msg: ciphertext,
        aad: associated_data,
    };

    cipher
        .decrypt(Nonce::from_slice(nonce), payload)
        .map_err(|_| Error::DecryptionFailed)
}

/// Generates a deterministic nonce from message number and chain identifier.
///
/// Format: `nonce = msg_num (4 bytes, LE) || chain_id[0..8] (8 bytes)`
///
/// Safe because each message key encrypts exactly one message.
#[must_use]
pub fn generate_nonce(message_number: u32, chain_id: &[u8; 32]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&message_number.to_le_bytes());
    nonce[4..12].copy_from_slice(&chain_id[..8]);
    nonce
}
