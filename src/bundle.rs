//! Pre-key records and the public bundle derived from them.
//!
//! A party publishes a [`PreKeyBundle`] so others can start a session while
//! it is offline. The bundle carries:
//! - the long-term identity key
//! - a signed pre-key (medium-term) with an XEdDSA signature made by the
//!   identity key over the serialized signed pre-key
//! - optionally one single-use pre-key
//!
//! The secret halves stay behind in the [`ProtocolStore`] as
//! [`SignedPreKeyRecord`] and [`PreKeyRecord`].

use crate::error::{Error, Result};
use crate::keys::{IdentityKeyPair, KeyPair, PublicKey, check_pre_key_id, generate_pre_key_id};
use crate::store::ProtocolStore;
use crate::xeddsa::SIGNATURE_LENGTH;
use rand_core::CryptoRngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Signed pre-key with its secret half, as kept by its owner.
#[derive(Debug, Clone)]
pub struct SignedPreKeyRecord {
    id: u32,
    timestamp: u64,
    key_pair: KeyPair,
    signature: [u8; SIGNATURE_LENGTH],
}

impl SignedPreKeyRecord {
    /// Generates a signed pre-key and signs it with `identity`.
    ///
    /// The timestamp is the current wall-clock time in milliseconds.
    pub fn generate<R: CryptoRngCore>(
        rng: &mut R,
        id: u32,
        identity: &IdentityKeyPair,
    ) -> Result<Self> {
        let key_pair = KeyPair::generate(rng);
        let signature = identity.sign(rng, &key_pair.public_key().serialize())?;

        Ok(Self::new(id, now_millis(), key_pair, signature))
    }

    #[must_use]
    pub fn new(
        id: u32,
        timestamp: u64,
        key_pair: KeyPair,
        signature: [u8; SIGNATURE_LENGTH],
    ) -> Self {
        Self {
            id,
            timestamp,
            key_pair,
            signature,
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Creation time, milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[must_use]
    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        self.key_pair.public_key()
    }

    #[must_use]
    pub fn signature(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.signature
    }
}

/// Single-use pre-key with its secret half.
#[derive(Debug, Clone)]
pub struct PreKeyRecord {
    id: u32,
    key_pair: KeyPair,
}

impl PreKeyRecord {
    pub fn generate<R: CryptoRngCore>(rng: &mut R, id: u32) -> Self {
        Self::new(id, KeyPair::generate(rng))
    }

    #[must_use]
    pub fn new(id: u32, key_pair: KeyPair) -> Self {
        Self { id, key_pair }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        self.key_pair.public_key()
    }
}

/// Public key material a party publishes so others can start sessions.
///
/// Contains an identity key, a signed pre-key with signature, and optionally
/// a one-time pre-key. Without the one-time pre-key the handshake falls back
/// to three DH computations.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PreKeyBundle {
    pub registration_id: u32,

    pub device_id: u32,

    /// One-time pre-key id and public key, if one was available
    pub one_time_pre_key: Option<(u32, PublicKey)>,

    pub signed_pre_key_id: u32,

    /// Medium-term signed pre-key
    pub signed_pre_key: PublicKey,

    /// XEdDSA signature over the serialized signed pre-key
    #[cfg_attr(feature = "serde", serde(with = "serde_arrays"))]
    pub signed_pre_key_signature: [u8; SIGNATURE_LENGTH],

    /// Long-term identity key
    pub identity_key: PublicKey,
}

impl PreKeyBundle {
    /// Verifies the signed pre-key signature against the bundle's identity key.
    ///
    /// # Returns
    /// - `Ok(())` if the signature is valid
    /// - `Err(Error::InvalidSignature)` otherwise
    pub fn verify_signature(&self) -> Result<()> {
        self.identity_key.verify_signature(
            &self.signed_pre_key.serialize(),
            &self.signed_pre_key_signature,
        )
    }

    /// Encodes the bundle for out-of-band publication.
    #[cfg(feature = "serde")]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    /// Decodes a bundle produced by [`PreKeyBundle::to_bytes`].
    ///
    /// The signature is not checked here; session setup does that.
    #[cfg(feature = "serde")]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (bundle, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(bundle)
    }
}

/// Generates a signed pre-key and a one-time pre-key, stores both and
/// returns the matching public bundle.
///
/// Ids are drawn at random. An id already in use is drawn again, so keys
/// behind earlier bundles stay valid.
///
/// # Errors
/// Returns `Error::StorageError` if the store is unusable.
pub fn create_pre_key_bundle<S, R>(store: &S, device_id: u32, rng: &mut R) -> Result<PreKeyBundle>
where
    S: ProtocolStore + ?Sized,
    R: CryptoRngCore,
{
    let identity = store.identity_key_pair();

    let mut signed_pre_key_id = check_pre_key_id(generate_pre_key_id(rng))?;
    let mut pre_key_id = check_pre_key_id(generate_pre_key_id(rng))?;

    let signed_key_pair = KeyPair::generate(rng);
    let signature = identity.sign(rng, &signed_key_pair.public_key().serialize())?;
    let pre_key_pair = KeyPair::generate(rng);

    let timestamp = now_millis();
    loop {
        let record =
            SignedPreKeyRecord::new(signed_pre_key_id, timestamp, signed_key_pair.clone(), signature);
        match store.store_signed_pre_key(signed_pre_key_id, record) {
            Ok(()) => break,
            Err(Error::DuplicateSignedPreKeyId(_)) => {
                tracing::trace!(signed_pre_key_id, "signed pre-key id taken, drawing again");
                signed_pre_key_id = check_pre_key_id(generate_pre_key_id(rng))?;
            }
            Err(error) => return Err(error),
        }
    }

    loop {
        match store.store_pre_key(pre_key_id, PreKeyRecord::new(pre_key_id, pre_key_pair.clone())) {
            Ok(()) => break,
            Err(Error::DuplicatePreKeyId(_)) => {
                tracing::trace!(pre_key_id, "pre-key id taken, drawing again");
                pre_key_id = check_pre_key_id(generate_pre_key_id(rng))?;
            }
            Err(error) => return Err(error),
        }
    }

    tracing::debug!(
        device_id,
        signed_pre_key_id,
        pre_key_id,
        "created pre-key bundle"
    );

    Ok(PreKeyBundle {
        registration_id: store.local_registration_id(),
        device_id,
        one_time_pre_key: Some((pre_key_id, *pre_key_pair.public_key())),
        signed_pre_key_id,
        signed_pre_key: *signed_key_pair.public_key(),
        signed_pre_key_signature: signature,
        identity_key: *identity.public_key(),
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryProtocolStore;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn bundle(rng: &mut StdRng) -> (InMemoryProtocolStore, PreKeyBundle) {
        let store = InMemoryProtocolStore::generate(rng);
        let bundle = create_pre_key_bundle(&store, 1, rng).unwrap();
        (store, bundle)
    }

    #[test]
    fn test_bundle_matches_stored_records() {
        let mut rng = StdRng::seed_from_u64(11);
        let (store, bundle) = bundle(&mut rng);

        bundle.verify_signature().unwrap();
        assert_eq!(bundle.registration_id, store.local_registration_id());
        assert_eq!(bundle.identity_key, *store.identity_key_pair().public_key());

        let signed = store.load_signed_pre_key(bundle.signed_pre_key_id).unwrap();
        assert_eq!(*signed.public_key(), bundle.signed_pre_key);
        assert!(signed.timestamp() > 0);

        let (pre_key_id, pre_key_public) = bundle.one_time_pre_key.unwrap();
        let pre_key = store.load_pre_key(pre_key_id).unwrap();
        assert_eq!(*pre_key.public_key(), pre_key_public);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let mut rng = StdRng::seed_from_u64(12);
        let (_, mut bundle) = bundle(&mut rng);

        bundle.signed_pre_key_signature[0] ^= 0xFF;

        assert_eq!(bundle.verify_signature(), Err(Error::InvalidSignature));
    }

    #[test]
    fn test_identity_substitution_rejected() {
        let mut rng = StdRng::seed_from_u64(13);
        let (_, mut bundle) = bundle(&mut rng);

        bundle.identity_key = *IdentityKeyPair::generate(&mut rng).public_key();

        assert_eq!(bundle.verify_signature(), Err(Error::InvalidSignature));
    }

    #[test]
    fn test_signature_bound_to_signed_pre_key() {
        let mut rng = StdRng::seed_from_u64(14);
        let (_, mut bundle) = bundle(&mut rng);

        bundle.signed_pre_key = *KeyPair::generate(&mut rng).public_key();

        assert_eq!(bundle.verify_signature(), Err(Error::InvalidSignature));
    }

    #[test]
    fn test_dropping_one_time_pre_key_keeps_signature_valid() {
        let mut rng = StdRng::seed_from_u64(15);
        let (_, mut bundle) = bundle(&mut rng);

        bundle.one_time_pre_key = None;

        bundle.verify_signature().unwrap();
    }

    #[test]
    fn test_taken_ids_are_drawn_again() {
        let mut rng = StdRng::seed_from_u64(17);
        let store = InMemoryProtocolStore::generate(&mut rng);

        // The first two draws of an identical generator are the ids the bundle would use
        let mut preview = rng.clone();
        let signed_id = generate_pre_key_id(&mut preview);
        let pre_key_id = generate_pre_key_id(&mut preview);

        let mut other = StdRng::seed_from_u64(18);
        let earlier_signed =
            SignedPreKeyRecord::generate(&mut other, signed_id, store.identity_key_pair()).unwrap();
        let earlier_signed_public = *earlier_signed.public_key();
        let earlier_pre_key = PreKeyRecord::generate(&mut other, pre_key_id);
        let earlier_pre_key_public = *earlier_pre_key.public_key();
        store.store_signed_pre_key(signed_id, earlier_signed).unwrap();
        store.store_pre_key(pre_key_id, earlier_pre_key).unwrap();

        let bundle = create_pre_key_bundle(&store, 1, &mut rng).unwrap();

        assert_ne!(bundle.signed_pre_key_id, signed_id);
        assert_ne!(bundle.one_time_pre_key.unwrap().0, pre_key_id);
        bundle.verify_signature().unwrap();

        // Earlier keys are untouched, the new ones stored under the new ids
        assert_eq!(
            *store.load_signed_pre_key(signed_id).unwrap().public_key(),
            earlier_signed_public
        );
        assert_eq!(
            *store.load_pre_key(pre_key_id).unwrap().public_key(),
            earlier_pre_key_public
        );
        assert_eq!(
            *store
                .load_signed_pre_key(bundle.signed_pre_key_id)
                .unwrap()
                .public_key(),
            bundle.signed_pre_key
        );
        let (new_id, new_public) = bundle.one_time_pre_key.unwrap();
        assert_eq!(*store.load_pre_key(new_id).unwrap().public_key(), new_public);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_bincode_encoding() {
        let mut rng = StdRng::seed_from_u64(16);
        let (_, bundle) = bundle(&mut rng);

        let decoded = PreKeyBundle::from_bytes(&bundle.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, bundle);
        decoded.verify_signature().unwrap();

        assert_eq!(
            PreKeyBundle::from_bytes(&[0xFF]),
            Err(Error::DeserializationError)
        );
    }
}
