//! Per-session ratchet state.
//!
//! ## State
//!
//! Each session keeps:
//! - Root key (RK): replaced on every DH ratchet step
//! - Sending chain key (`CK_s`): advanced on each sent message
//! - Receiving chains (`CK_r`): one per remote ratchet key seen, newest last
//! - Local ratchet key pair: rotated on every DH ratchet step
//!
//! A [`SessionRecord`] holds the state in use plus superseded states, so a
//! late message for an older session with the same peer still decrypts.

use crate::config::SessionConfig;
use crate::crypto::{SymmetricKey, kdf_chain, kdf_root};
use crate::error::{Error, Result};
use crate::keys::{KeyPair, PublicKey};
use crate::protocol::CIPHERTEXT_MESSAGE_CURRENT_VERSION;
use rand_core::CryptoRngCore;
use std::collections::{BTreeMap, VecDeque};

/// Chain key with its position in the chain.
#[derive(Clone)]
pub(crate) struct ChainKey {
    key: SymmetricKey,
    index: u32,
}

impl ChainKey {
    fn new(key: SymmetricKey, index: u32) -> Self {
        Self { key, index }
    }

    /// Message key for `self.index` and the chain key following it.
    fn step(&self) -> Result<(ChainKey, SymmetricKey)> {
        let (next, message_key) = kdf_chain(&self.key)?;
        let index = self.index.checked_add(1).ok_or(Error::CryptoError)?;
        Ok((ChainKey::new(next, index), message_key))
    }
}

#[derive(Clone)]
struct ReceiverChain {
    ratchet_key: PublicKey,
    chain_key: ChainKey,
    /// Keys of messages that arrived out of order, by counter
    skipped: BTreeMap<u32, SymmetricKey>,
}

/// Handshake parameters repeated in every message until the peer replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingPreKey {
    pub(crate) pre_key_id: Option<u32>,
    pub(crate) signed_pre_key_id: u32,
    pub(crate) base_key: PublicKey,
}

/// Identity and bookkeeping shared by both ends when a session is created.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionSetup {
    pub(crate) local_identity: PublicKey,
    pub(crate) remote_identity: PublicKey,
    pub(crate) local_registration_id: u32,
    pub(crate) remote_registration_id: u32,
    pub(crate) alice_base_key: PublicKey,
    pub(crate) used_one_time_pre_key: bool,
}

/// Ratchet state of one session with one remote device.
#[derive(Clone)]
pub struct SessionState {
    version: u8,
    local_identity: PublicKey,
    remote_identity: PublicKey,
    local_registration_id: u32,
    remote_registration_id: u32,
    root_key: SymmetricKey,
    local_ratchet: KeyPair,
    sender_chain: Option<ChainKey>,
    previous_counter: u32,
    receiver_chains: VecDeque<ReceiverChain>,
    pending_pre_key: Option<PendingPreKey>,
    alice_base_key: PublicKey,
    used_one_time_pre_key: bool,
}

impl SessionState {
    /// Initiator state after the handshake.
    ///
    /// Performs the first DH ratchet step against the remote signed pre-key,
    /// which serves as the initial remote ratchet key.
    pub(crate) fn initiator<R: CryptoRngCore>(
        rng: &mut R,
        setup: SessionSetup,
        shared_secret: &SymmetricKey,
        their_signed_pre_key: &PublicKey,
        pending: PendingPreKey,
    ) -> Result<Self> {
        let local_ratchet = KeyPair::generate(rng);
        let dh_output = local_ratchet.diffie_hellman(their_signed_pre_key);
        let (root_key, sending_chain) = kdf_root(shared_secret, &dh_output)?;

        let mut state = Self::new(setup, root_key, local_ratchet);
        state.sender_chain = Some(ChainKey::new(sending_chain, 0));
        state.pending_pre_key = Some(pending);
        Ok(state)
    }

    /// Responder state after the handshake.
    ///
    /// The signed pre-key pair is the local ratchet key; the sending chain
    /// appears with the DH ratchet step the first message triggers.
    pub(crate) fn responder(
        setup: SessionSetup,
        shared_secret: SymmetricKey,
        our_signed_pre_key: KeyPair,
    ) -> Self {
        Self::new(setup, shared_secret, our_signed_pre_key)
    }

    fn new(setup: SessionSetup, root_key: SymmetricKey, local_ratchet: KeyPair) -> Self {
        Self {
            version: CIPHERTEXT_MESSAGE_CURRENT_VERSION,
            local_identity: setup.local_identity,
            remote_identity: setup.remote_identity,
            local_registration_id: setup.local_registration_id,
            remote_registration_id: setup.remote_registration_id,
            root_key,
            local_ratchet,
            sender_chain: None,
            previous_counter: 0,
            receiver_chains: VecDeque::new(),
            pending_pre_key: None,
            alice_base_key: setup.alice_base_key,
            used_one_time_pre_key: setup.used_one_time_pre_key,
        }
    }

    #[must_use]
    pub fn session_version(&self) -> u8 {
        self.version
    }

    #[must_use]
    pub fn local_identity_key(&self) -> &PublicKey {
        &self.local_identity
    }

    #[must_use]
    pub fn remote_identity_key(&self) -> &PublicKey {
        &self.remote_identity
    }

    #[must_use]
    pub fn local_registration_id(&self) -> u32 {
        self.local_registration_id
    }

    #[must_use]
    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    /// Initiator's base key; both ends record the same value.
    #[must_use]
    pub fn alice_base_key(&self) -> &PublicKey {
        &self.alice_base_key
    }

    /// Whether the handshake included a one-time pre-key (4-DH) or not (3-DH).
    #[must_use]
    pub fn used_one_time_pre_key(&self) -> bool {
        self.used_one_time_pre_key
    }

    #[must_use]
    pub fn has_sender_chain(&self) -> bool {
        self.sender_chain.is_some()
    }

    /// Counter the next sent message will carry.
    #[must_use]
    pub fn sender_chain_index(&self) -> Option<u32> {
        self.sender_chain.as_ref().map(|chain| chain.index)
    }

    /// Whether outgoing messages still carry the handshake parameters.
    #[must_use]
    pub fn has_unacknowledged_pre_key(&self) -> bool {
        self.pending_pre_key.is_some()
    }

    #[must_use]
    pub fn receiver_chain_count(&self) -> usize {
        self.receiver_chains.len()
    }

    /// Next expected counter on the chain for `ratchet_key`.
    #[must_use]
    pub fn receiver_chain_index(&self, ratchet_key: &PublicKey) -> Option<u32> {
        self.receiver_chain(ratchet_key)
            .map(|position| self.receiver_chains[position].chain_key.index)
    }

    /// Cached out-of-order message keys across all receiving chains.
    #[must_use]
    pub fn skipped_message_key_count(&self) -> usize {
        self.receiver_chains
            .iter()
            .map(|chain| chain.skipped.len())
            .sum()
    }

    pub(crate) fn pending_pre_key(&self) -> Option<&PendingPreKey> {
        self.pending_pre_key.as_ref()
    }

    pub(crate) fn clear_pending_pre_key(&mut self) {
        self.pending_pre_key = None;
    }

    pub(crate) fn local_ratchet_key(&self) -> &PublicKey {
        self.local_ratchet.public_key()
    }

    pub(crate) fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    /// Advances the sending chain, returning the counter and message key.
    pub(crate) fn next_sending_key(&mut self) -> Result<(u32, SymmetricKey)> {
        let chain = self.sender_chain.as_ref().ok_or(Error::CryptoError)?;
        let counter = chain.index;
        let (next, message_key) = chain.step()?;
        self.sender_chain = Some(next);
        Ok((counter, message_key))
    }

    /// Message key for `counter` on the chain of `their_ratchet_key`.
    ///
    /// An unknown ratchet key triggers a DH ratchet step first. Keys skipped
    /// over are cached; a cached key is handed out once and then erased.
    ///
    /// # Errors
    /// - `Error::DuplicateMessage` if the key for `counter` was already used
    /// - `Error::TooManySkippedMessages` if `counter` is more than
    ///   `config.max_skip` ahead of the chain
    pub(crate) fn receiving_key<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        their_ratchet_key: &PublicKey,
        counter: u32,
        config: &SessionConfig,
    ) -> Result<SymmetricKey> {
        let position = match self.receiver_chain(their_ratchet_key) {
            Some(position) => position,
            None => self.ratchet_step(rng, their_ratchet_key, config)?,
        };
        let chain = &mut self.receiver_chains[position];

        if counter < chain.chain_key.index {
            return chain.skipped.remove(&counter).ok_or_else(|| {
                tracing::debug!(counter, "message key already used");
                Error::DuplicateMessage
            });
        }

        if counter - chain.chain_key.index > config.max_skip {
            tracing::warn!(
                counter,
                chain_index = chain.chain_key.index,
                max_skip = config.max_skip,
                "rejecting message too far ahead"
            );
            return Err(Error::TooManySkippedMessages);
        }

        let mut current = chain.chain_key.clone();
        while current.index < counter {
            let (next, skipped_key) = current.step()?;
            chain.skipped.insert(current.index, skipped_key);
            if chain.skipped.len() > config.max_cached_message_keys {
                chain.skipped.pop_first();
            }
            current = next;
        }

        let (next, message_key) = current.step()?;
        chain.chain_key = next;
        Ok(message_key)
    }

    fn receiver_chain(&self, ratchet_key: &PublicKey) -> Option<usize> {
        self.receiver_chains
            .iter()
            .position(|chain| chain.ratchet_key == *ratchet_key)
    }

    /// DH ratchet step for a newly seen remote ratchet key.
    ///
    /// Returns the position of the new receiving chain.
    fn ratchet_step<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        their_ratchet_key: &PublicKey,
        config: &SessionConfig,
    ) -> Result<usize> {
        let dh_output = self.local_ratchet.diffie_hellman(their_ratchet_key);
        let (root_key, receiving_chain) = kdf_root(&self.root_key, &dh_output)?;

        let local_ratchet = KeyPair::generate(rng);
        let dh_output = local_ratchet.diffie_hellman(their_ratchet_key);
        let (root_key, sending_chain) = kdf_root(&root_key, &dh_output)?;

        self.previous_counter = self.sender_chain_index().unwrap_or(0);
        self.root_key = root_key;
        self.local_ratchet = local_ratchet;
        self.sender_chain = Some(ChainKey::new(sending_chain, 0));

        self.receiver_chains.push_back(ReceiverChain {
            ratchet_key: *their_ratchet_key,
            chain_key: ChainKey::new(receiving_chain, 0),
            skipped: BTreeMap::new(),
        });
        while self.receiver_chains.len() > config.max_receiver_chains.max(1) {
            self.receiver_chains.pop_front();
        }

        tracing::trace!(
            previous_counter = self.previous_counter,
            receiver_chains = self.receiver_chains.len(),
            "performed DH ratchet step"
        );

        Ok(self.receiver_chains.len() - 1)
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("version", &self.version)
            .field("remote_registration_id", &self.remote_registration_id)
            .field("sender_chain_index", &self.sender_chain_index())
            .field("previous_counter", &self.previous_counter)
            .field("receiver_chains", &self.receiver_chains.len())
            .field("skipped_keys", &self.skipped_message_key_count())
            .field("pending_pre_key", &self.pending_pre_key.is_some())
            .finish_non_exhaustive()
    }
}

/// All session states kept for one remote address.
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    current: Option<SessionState>,
    previous: VecDeque<SessionState>,
}

impl SessionRecord {
    #[must_use]
    pub fn new(state: SessionState) -> Self {
        Self {
            current: Some(state),
            previous: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn session_state(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    pub(crate) fn session_state_mut(&mut self) -> Option<&mut SessionState> {
        self.current.as_mut()
    }

    #[must_use]
    pub fn has_current_state(&self) -> bool {
        self.current.is_some()
    }

    /// Superseded states, most recent first.
    pub fn previous_states(&self) -> impl Iterator<Item = &SessionState> {
        self.previous.iter()
    }

    /// Makes `state` current, archiving the old current state.
    ///
    /// At most `max_archived` states are kept; the oldest are dropped.
    pub(crate) fn promote_state(&mut self, state: SessionState, max_archived: usize) {
        if let Some(old) = self.current.replace(state) {
            self.previous.push_front(old);
        }
        self.previous.truncate(max_archived);
    }

    /// Makes the archived state at `index` current.
    pub(crate) fn promote_previous(&mut self, index: usize, max_archived: usize) {
        if let Some(state) = self.previous.remove(index) {
            self.promote_state(state, max_archived);
        }
    }

    /// Promotes the state created from the handshake with `base_key`, if any.
    ///
    /// Returns whether such a state exists.
    pub(crate) fn promote_matching_base_key(
        &mut self,
        base_key: &PublicKey,
        max_archived: usize,
    ) -> bool {
        if self
            .current
            .as_ref()
            .is_some_and(|state| state.alice_base_key == *base_key)
        {
            return true;
        }

        match self
            .previous
            .iter()
            .position(|state| state.alice_base_key == *base_key)
        {
            Some(index) => {
                self.promote_previous(index, max_archived);
                true
            }
            None => false,
        }
    }

    pub(crate) fn previous_state_count(&self) -> usize {
        self.previous.len()
    }

    pub(crate) fn previous_state(&self, index: usize) -> Option<&SessionState> {
        self.previous.get(index)
    }

    pub(crate) fn set_previous_state(&mut self, index: usize, state: SessionState) {
        if let Some(slot) = self.previous.get_mut(index) {
            *slot = state;
        }
    }
}
