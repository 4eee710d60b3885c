//! Double Ratchet message encryption for an established session.
//!
//! Provides:
//! - Forward secrecy: every message key is derived once and then erased
//! - Post-compromise security: each reply triggers a fresh DH ratchet step
//! - Out-of-order delivery within the configured skip limit
//!
//! Every call loads the session record, works on that copy and stores it
//! back only on success, so a failed call never changes persisted state.

use crate::address::ProtocolAddress;
use crate::config::SessionConfig;
use crate::crypto::{self, generate_nonce};
use crate::error::{Error, Result};
use crate::protocol::{CiphertextMessage, PreKeySignalMessage, SignalMessage};
use crate::session_builder::SessionBuilder;
use crate::state::{SessionRecord, SessionState};
use crate::store::ProtocolStore;
use rand_core::CryptoRngCore;

/// Encrypts to and decrypts from one remote address.
#[derive(Debug)]
pub struct SessionCipher<'a, S: ProtocolStore + ?Sized> {
    store: &'a S,
    remote_address: ProtocolAddress,
    config: SessionConfig,
}

impl<'a, S: ProtocolStore + ?Sized> SessionCipher<'a, S> {
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

    #[must_use]
    pub fn remote_address(&self) -> &ProtocolAddress {
        &self.remote_address
    }

    /// Encrypts `plaintext` with the next key of the sending chain.
    ///
    /// Returns a pre-key message while the peer has not replied yet, an
    /// ordinary message afterwards.
    ///
    /// # Errors
    /// Returns `Error::NoSession` if no session with a sending chain exists.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<CiphertextMessage> {
        let lock = self.store.session_lock(&self.remote_address)?;
        let _guard = lock.lock().map_err(|_| Error::StorageError)?;

        let mut record = self
            .store
            .load_session(&self.remote_address)?
            .ok_or_else(|| self.no_session())?;
        let state = record
            .session_state_mut()
            .filter(|state| state.has_sender_chain())
            .ok_or_else(|| self.no_session())?;

        let (counter, message_key) = state.next_sending_key()?;
        let ratchet_key = *state.local_ratchet_key();
        let previous_counter = state.previous_counter();

        let header = SignalMessage::new(ratchet_key, counter, previous_counter, Vec::new());
        let associated_data =
            header.associated_data(state.local_identity_key(), state.remote_identity_key());
        let nonce = generate_nonce(counter, ratchet_key.as_bytes());
        let ciphertext = crypto::encrypt(&message_key, &nonce, plaintext, &associated_data)?;

        let message = SignalMessage::new(ratchet_key, counter, previous_counter, ciphertext);
        let message = match state.pending_pre_key() {
            Some(pending) => CiphertextMessage::PreKey(PreKeySignalMessage::new(
                state.local_registration_id(),
                pending.pre_key_id,
                pending.signed_pre_key_id,
                pending.base_key,
                *state.local_identity_key(),
                message,
            )),
            None => CiphertextMessage::Signal(message),
        };

        self.store.store_session(&self.remote_address, record)?;

        tracing::trace!(
            address = %self.remote_address,
            counter,
            message_type = message.message_type(),
            "encrypted message"
        );

        Ok(message)
    }

    /// Decrypts a message from the remote address.
    ///
    /// A pre-key message sets up the responder side of the session first,
    /// unless it belongs to a session that already exists.
    ///
    /// # Errors
    /// - `Error::NoSession` for an ordinary message with no session
    /// - `Error::DuplicateMessage` if the message was already decrypted
    /// - `Error::DecryptionFailed` if authentication fails
    /// - `Error::TooManySkippedMessages` if the counter is too far ahead
    /// - `Error::InvalidPreKeyId` if the referenced one-time pre-key is gone
    /// - `Error::UntrustedIdentity` if the sender's identity key changed
    pub fn decrypt<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        message: &CiphertextMessage,
    ) -> Result<Vec<u8>> {
        let lock = self.store.session_lock(&self.remote_address)?;
        let _guard = lock.lock().map_err(|_| Error::StorageError)?;

        let result = match message {
            CiphertextMessage::PreKey(message) => self.decrypt_pre_key_message(rng, message),
            CiphertextMessage::Signal(message) => self.decrypt_signal_message(rng, message),
        };

        if let Err(error) = &result {
            tracing::debug!(address = %self.remote_address, %error, "failed to decrypt message");
        }
        result
    }

    /// Parses `bytes` and decrypts the message.
    pub fn decrypt_bytes<R: CryptoRngCore>(&self, rng: &mut R, bytes: &[u8]) -> Result<Vec<u8>> {
        self.decrypt(rng, &CiphertextMessage::deserialize(bytes)?)
    }

    /// Registration id the remote party announced for the current session.
    pub fn remote_registration_id(&self) -> Result<u32> {
        self.with_current_state(SessionState::remote_registration_id)
    }

    pub fn session_version(&self) -> Result<u8> {
        self.with_current_state(SessionState::session_version)
    }

    fn with_current_state<T>(&self, f: impl FnOnce(&SessionState) -> T) -> Result<T> {
        self.store
            .load_session(&self.remote_address)?
            .as_ref()
            .and_then(SessionRecord::session_state)
            .map(f)
            .ok_or_else(|| self.no_session())
    }

    fn decrypt_pre_key_message<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        message: &PreKeySignalMessage,
    ) -> Result<Vec<u8>> {
        let mut record = self
            .store
            .load_session(&self.remote_address)?
            .unwrap_or_default();

        let builder = SessionBuilder::with_config(self.store, self.remote_address.clone(), self.config);
        let used_pre_key = builder.process_pre_key_message(&mut record, message)?;

        let state = record
            .session_state_mut()
            .ok_or_else(|| self.no_session())?;
        let plaintext = self.decrypt_with_state(rng, state, message.message())?;

        // Another session may have claimed the same pre-key meanwhile
        if let Some(pre_key_id) = used_pre_key {
            self.store.take_pre_key(pre_key_id).inspect_err(|_| {
                tracing::warn!(
                    address = %self.remote_address,
                    pre_key_id,
                    "one-time pre-key already consumed"
                );
            })?;
            tracing::debug!(address = %self.remote_address, pre_key_id, "consumed one-time pre-key");
        }

        self.store.store_session(&self.remote_address, record)?;
        self.store
            .save_identity(&self.remote_address, message.identity_key())?;

        Ok(plaintext)
    }

    fn decrypt_signal_message<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        message: &SignalMessage,
    ) -> Result<Vec<u8>> {
        let mut record = self
            .store
            .load_session(&self.remote_address)?
            .filter(SessionRecord::has_current_state)
            .ok_or_else(|| self.no_session())?;

        let plaintext = self.decrypt_with_record(rng, &mut record, message)?;

        self.store.store_session(&self.remote_address, record)?;
        Ok(plaintext)
    }

    /// Tries the current state, then archived states in order.
    ///
    /// The state that decrypts becomes current. If none does, the error
    /// from the current state is returned.
    fn decrypt_with_record<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        record: &mut SessionRecord,
        message: &SignalMessage,
    ) -> Result<Vec<u8>> {
        let mut current = record
            .session_state()
            .cloned()
            .ok_or_else(|| self.no_session())?;

        let current_error = match self.decrypt_with_state(rng, &mut current, message) {
            Ok(plaintext) => {
                if let Some(slot) = record.session_state_mut() {
                    *slot = current;
                }
                return Ok(plaintext);
            }
            Err(error) => error,
        };

        for index in 0..record.previous_state_count() {
            let Some(mut candidate) = record.previous_state(index).cloned() else {
                break;
            };

            if let Ok(plaintext) = self.decrypt_with_state(rng, &mut candidate, message) {
                tracing::debug!(address = %self.remote_address, index, "decrypted with archived session");
                record.set_previous_state(index, candidate);
                record.promote_previous(index, self.config.max_archived_states);
                return Ok(plaintext);
            }
        }

        Err(current_error)
    }

    fn decrypt_with_state<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        state: &mut SessionState,
        message: &SignalMessage,
    ) -> Result<Vec<u8>> {
        let message_key = state.receiving_key(
            rng,
            message.ratchet_key(),
            message.counter(),
            &self.config,
        )?;

        let nonce = generate_nonce(message.counter(), message.ratchet_key().as_bytes());
        let associated_data =
            message.associated_data(state.remote_identity_key(), state.local_identity_key());
        let plaintext = crypto::decrypt(&message_key, &nonce, message.ciphertext(), &associated_data)?;

        state.clear_pending_pre_key();
        Ok(plaintext)
    }

    fn no_session(&self) -> Error {
        Error::NoSession(self.remote_address.clone())
    }
}
