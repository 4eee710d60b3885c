//! Session establishment (X3DH-style handshake).
//!
//! ## Protocol Flow
//!
//! 1. **Responder (Bob)** publishes a [`PreKeyBundle`]: identity key,
//!    signed pre-key with signature, optionally a one-time pre-key.
//!
//! 2. **Initiator (Alice)** verifies the bundle, generates a base key and
//!    computes:
//!    - DH1 = `DH(IK_A, SPK_B)`
//!    - DH2 = `DH(EK_A, IK_B)`
//!    - DH3 = `DH(EK_A, SPK_B)`
//!    - DH4 = `DH(EK_A, OPK_B)` [if OPK available]
//!    - SK = KDF(DH1 || DH2 || DH3 || DH4)
//!
//! 3. **Responder (Bob)** receives the first pre-key message and mirrors
//!    the computation with the matching secret keys.

use crate::address::ProtocolAddress;
use crate::bundle::PreKeyBundle;
use crate::config::SessionConfig;
use crate::crypto::derive_x3dh_secret;
use crate::error::{Error, Result};
use crate::keys::{KeyPair, PublicKey};
use crate::protocol::PreKeySignalMessage;
use crate::state::{PendingPreKey, SessionRecord, SessionSetup, SessionState};
use crate::store::ProtocolStore;
use rand_core::CryptoRngCore;

/// Builds sessions with one remote address.
#[derive(Debug)]
pub struct SessionBuilder<'a, S: ProtocolStore + ?Sized> {
    store: &'a S,
    remote_address: ProtocolAddress,
    config: SessionConfig,
}

impl<'a, S: ProtocolStore + ?Sized> SessionBuilder<'a, S> {
    pub fn new(store: &'a S, remote_address: ProtocolAddress) -> Self {
        Self::with_config(store, remote_address, SessionConfig::default())
    }

    pub fn with_config(store: &'a S, remote_address: ProtocolAddress, config: SessionConfig) -> Self {
        Self {
            store,
            remote_address,
            config,
        }
    }

    /// Starts a session from the remote party's bundle (initiator side).
    ///
    /// Any existing session with the address is archived and the new one
    /// becomes current. Until a reply arrives, every outgoing message is a
    /// pre-key message.
    ///
    /// # Errors
    /// - `Error::InvalidSignature` if the signed pre-key signature is bad
    /// - `Error::UntrustedIdentity` if the address is known under another
    ///   identity key
    ///
    /// Nothing is stored on failure.
    pub fn process<R: CryptoRngCore>(&self, rng: &mut R, bundle: &PreKeyBundle) -> Result<()> {
        let lock = self.store.session_lock(&self.remote_address)?;
        let _guard = lock.lock().map_err(|_| Error::StorageError)?;

        if let Err(error) = bundle.verify_signature() {
            tracing::warn!(address = %self.remote_address, "rejecting bundle with bad signature");
            return Err(error);
        }
        self.check_trust(&bundle.identity_key)?;

        let identity = self.store.identity_key_pair();
        let base_key = KeyPair::generate(rng);

        // DH1 = DH(IK_A, SPK_B)
        let dh1 = identity.secret_key().diffie_hellman(&bundle.signed_pre_key);
        // DH2 = DH(EK_A, IK_B)
        let dh2 = base_key.diffie_hellman(&bundle.identity_key);
        // DH3 = DH(EK_A, SPK_B)
        let dh3 = base_key.diffie_hellman(&bundle.signed_pre_key);
        // DH4 = DH(EK_A, OPK_B)
        let dh4 = bundle
            .one_time_pre_key
            .map(|(_, one_time)| base_key.diffie_hellman(&one_time));

        let shared_secret = derive_x3dh_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

        let setup = SessionSetup {
            local_identity: *identity.public_key(),
            remote_identity: bundle.identity_key,
            local_registration_id: self.store.local_registration_id(),
            remote_registration_id: bundle.registration_id,
            alice_base_key: *base_key.public_key(),
            used_one_time_pre_key: dh4.is_some(),
        };
        let pending = PendingPreKey {
            pre_key_id: bundle.one_time_pre_key.map(|(id, _)| id),
            signed_pre_key_id: bundle.signed_pre_key_id,
            base_key: *base_key.public_key(),
        };
        let state = SessionState::initiator(
            rng,
            setup,
            &shared_secret,
            &bundle.signed_pre_key,
            pending,
        )?;

        let mut record = self
            .store
            .load_session(&self.remote_address)?
            .unwrap_or_default();
        record.promote_state(state, self.config.max_archived_states);

        self.store.store_session(&self.remote_address, record)?;
        self.store
            .save_identity(&self.remote_address, &bundle.identity_key)?;

        tracing::debug!(
            address = %self.remote_address,
            signed_pre_key_id = bundle.signed_pre_key_id,
            one_time_pre_key = dh4.is_some(),
            "initiated session"
        );

        Ok(())
    }

    /// Responder side of the handshake, run on a working copy of `record`.
    ///
    /// Reuses the state already built for `message.base_key()` if there is
    /// one. Otherwise builds and promotes a fresh responder state. Returns
    /// the one-time pre-key to delete once the message has decrypted.
    ///
    /// The caller holds the session lock and persists `record`.
    pub(crate) fn process_pre_key_message(
        &self,
        record: &mut SessionRecord,
        message: &PreKeySignalMessage,
    ) -> Result<Option<u32>> {
        self.check_trust(message.identity_key())?;

        if record.promote_matching_base_key(message.base_key(), self.config.max_archived_states) {
            tracing::trace!(address = %self.remote_address, "pre-key message for known session");
            return Ok(None);
        }

        let signed_pre_key = self
            .store
            .load_signed_pre_key(message.signed_pre_key_id())?;
        let one_time_pre_key = message
            .pre_key_id()
            .map(|id| self.store.load_pre_key(id))
            .transpose()?;

        let identity = self.store.identity_key_pair();

        // DH1 = DH(SPK_B, IK_A)
        let dh1 = signed_pre_key
            .key_pair()
            .diffie_hellman(message.identity_key());
        // DH2 = DH(IK_B, EK_A)
        let dh2 = identity.secret_key().diffie_hellman(message.base_key());
        // DH3 = DH(SPK_B, EK_A)
        let dh3 = signed_pre_key.key_pair().diffie_hellman(message.base_key());
        // DH4 = DH(OPK_B, EK_A)
        let dh4 = one_time_pre_key
            .as_ref()
            .map(|pre_key| pre_key.key_pair().diffie_hellman(message.base_key()));

        let shared_secret = derive_x3dh_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

        let setup = SessionSetup {
            local_identity: *identity.public_key(),
            remote_identity: *message.identity_key(),
            local_registration_id: self.store.local_registration_id(),
            remote_registration_id: message.registration_id(),
            alice_base_key: *message.base_key(),
            used_one_time_pre_key: dh4.is_some(),
        };
        let state = SessionState::responder(setup, shared_secret, signed_pre_key.key_pair().clone());
        record.promote_state(state, self.config.max_archived_states);

        tracing::debug!(
            address = %self.remote_address,
            signed_pre_key_id = message.signed_pre_key_id(),
            pre_key_id = ?message.pre_key_id(),
            "accepted session from pre-key message"
        );

        Ok(message.pre_key_id())
    }

    fn check_trust(&self, identity: &PublicKey) -> Result<()> {
        if self
            .store
            .is_trusted_identity(&self.remote_address, identity)?
        {
            Ok(())
        } else {
            tracing::warn!(address = %self.remote_address, "identity key changed");
            Err(Error::UntrustedIdentity(self.remote_address.clone()))
        }
    }
}
