//! Storage abstractions for pre-keys, sessions and trusted identities.
//!
//! [`ProtocolStore`] is the only place protocol state lives between calls.
//! Session establishment and the session cipher read a record, work on a
//! copy and write it back only when the whole operation succeeded.

use crate::address::ProtocolAddress;
use crate::bundle::{PreKeyRecord, SignedPreKeyRecord};
use crate::error::{Error, Result};
use crate::keys::{IdentityKeyPair, PublicKey, check_pre_key_id, generate_registration_id};
use crate::state::SessionRecord;
use rand_core::CryptoRngCore;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};

/// Storage backend for one party's protocol state.
///
/// Implementations must be thread-safe (`Send + Sync`); all methods take
/// `&self` and use interior mutability. The per-address
/// [`session_lock`](ProtocolStore::session_lock) serializes the
/// read-modify-write cycles of one session.
pub trait ProtocolStore: Send + Sync {
    /// Long-term identity of the local party.
    fn identity_key_pair(&self) -> &IdentityKeyPair;

    fn local_registration_id(&self) -> u32;

    /// Stores a signed pre-key.
    ///
    /// # Errors
    /// Returns `Error::DuplicateSignedPreKeyId` if the id is taken.
    fn store_signed_pre_key(&self, id: u32, record: SignedPreKeyRecord) -> Result<()>;

    /// # Errors
    /// Returns `Error::InvalidSignedPreKeyId` if no such key is stored.
    fn load_signed_pre_key(&self, id: u32) -> Result<SignedPreKeyRecord>;

    /// Stores a one-time pre-key.
    ///
    /// # Errors
    /// Returns `Error::DuplicatePreKeyId` if the id is taken and
    /// `Error::InvalidKeyId` if it is outside the medium integer range.
    fn store_pre_key(&self, id: u32, record: PreKeyRecord) -> Result<()>;

    /// # Errors
    /// Returns `Error::InvalidPreKeyId` if no such key is stored.
    fn load_pre_key(&self, id: u32) -> Result<PreKeyRecord>;

    /// Removes and returns a one-time pre-key in one step.
    ///
    /// Of several callers racing for the same id, exactly one gets the key.
    ///
    /// # Errors
    /// Returns `Error::InvalidPreKeyId` if no such key is stored.
    fn take_pre_key(&self, id: u32) -> Result<PreKeyRecord>;

    /// Removes a one-time pre-key. Removing an absent id is not an error.
    fn remove_pre_key(&self, id: u32) -> Result<()>;

    /// Number of one-time pre-keys still available.
    fn pre_key_count(&self) -> Result<usize>;

    fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>>;

    fn store_session(&self, address: &ProtocolAddress, record: SessionRecord) -> Result<()>;

    fn contains_session(&self, address: &ProtocolAddress) -> Result<bool>;

    /// Records `identity` for `address`.
    ///
    /// Returns `true` if it replaced a different key.
    fn save_identity(&self, address: &ProtocolAddress, identity: &PublicKey) -> Result<bool>;

    /// Trust on first use: an address with no recorded identity trusts any
    /// key, otherwise only the recorded one.
    fn is_trusted_identity(&self, address: &ProtocolAddress, identity: &PublicKey)
    -> Result<bool>;

    /// Mutex guarding the session with `address`.
    ///
    /// Repeated calls for one address return the same mutex.
    fn session_lock(&self, address: &ProtocolAddress) -> Result<Arc<Mutex<()>>>;
}

/// Thread-safe in-memory protocol store.
///
/// Suitable for testing and applications that don't require persistence.
/// Clones share the same underlying maps.
#[derive(Clone)]
pub struct InMemoryProtocolStore {
    identity: IdentityKeyPair,
    registration_id: u32,
    signed_pre_keys: Arc<Mutex<HashMap<u32, SignedPreKeyRecord>>>,
    pre_keys: Arc<Mutex<HashMap<u32, PreKeyRecord>>>,
    sessions: Arc<Mutex<HashMap<ProtocolAddress, SessionRecord>>>,
    identities: Arc<Mutex<HashMap<ProtocolAddress, PublicKey>>>,
    session_locks: Arc<Mutex<HashMap<ProtocolAddress, Arc<Mutex<()>>>>>,
}

impl InMemoryProtocolStore {
    /// Creates an empty store for the given local identity.
    #[must_use]
    pub fn new(identity: IdentityKeyPair, registration_id: u32) -> Self {
        Self {
            identity,
            registration_id,
            signed_pre_keys: Arc::default(),
            pre_keys: Arc::default(),
            sessions: Arc::default(),
            identities: Arc::default(),
            session_locks: Arc::default(),
        }
    }

    /// Creates an empty store with a fresh identity and registration id.
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        let identity = IdentityKeyPair::generate(rng);
        let registration_id = generate_registration_id(rng);
        Self::new(identity, registration_id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| Error::StorageError)
}

impl ProtocolStore for InMemoryProtocolStore {
    fn identity_key_pair(&self) -> &IdentityKeyPair {
        &self.identity
    }

    fn local_registration_id(&self) -> u32 {
        self.registration_id
    }

    fn store_signed_pre_key(&self, id: u32, record: SignedPreKeyRecord) -> Result<()> {
        match lock(&self.signed_pre_keys)?.entry(id) {
            Entry::Occupied(_) => Err(Error::DuplicateSignedPreKeyId(id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    fn load_signed_pre_key(&self, id: u32) -> Result<SignedPreKeyRecord> {
        lock(&self.signed_pre_keys)?
            .get(&id)
            .cloned()
            .ok_or(Error::InvalidSignedPreKeyId(id))
    }

    fn store_pre_key(&self, id: u32, record: PreKeyRecord) -> Result<()> {
        check_pre_key_id(id)?;

        match lock(&self.pre_keys)?.entry(id) {
            Entry::Occupied(_) => Err(Error::DuplicatePreKeyId(id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    fn load_pre_key(&self, id: u32) -> Result<PreKeyRecord> {
        lock(&self.pre_keys)?
            .get(&id)
            .cloned()
            .ok_or(Error::InvalidPreKeyId(id))
    }

    fn take_pre_key(&self, id: u32) -> Result<PreKeyRecord> {
        lock(&self.pre_keys)?
            .remove(&id)
            .ok_or(Error::InvalidPreKeyId(id))
    }

    fn remove_pre_key(&self, id: u32) -> Result<()> {
        lock(&self.pre_keys)?.remove(&id);
        Ok(())
    }

    fn pre_key_count(&self) -> Result<usize> {
        Ok(lock(&self.pre_keys)?.len())
    }

    fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>> {
        Ok(lock(&self.sessions)?.get(address).cloned())
    }

    fn store_session(&self, address: &ProtocolAddress, record: SessionRecord) -> Result<()> {
        lock(&self.sessions)?.insert(address.clone(), record);
        Ok(())
    }

    fn contains_session(&self, address: &ProtocolAddress) -> Result<bool> {
        Ok(lock(&self.sessions)?
            .get(address)
            .is_some_and(SessionRecord::has_current_state))
    }

    fn save_identity(&self, address: &ProtocolAddress, identity: &PublicKey) -> Result<bool> {
        let previous = lock(&self.identities)?.insert(address.clone(), *identity);
        Ok(previous.is_some_and(|previous| previous != *identity))
    }

    fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &PublicKey,
    ) -> Result<bool> {
        Ok(lock(&self.identities)?
            .get(address)
            .is_none_or(|known| known == identity))
    }

    fn session_lock(&self, address: &ProtocolAddress) -> Result<Arc<Mutex<()>>> {
        Ok(Arc::clone(
            lock(&self.session_locks)?
                .entry(address.clone())
                .or_default(),
        ))
    }
}

impl std::fmt::Debug for InMemoryProtocolStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProtocolStore")
            .field("registration_id", &self.registration_id)
            .field("identity", self.identity.public_key())
            .finish_non_exhaustive()
    }
}
