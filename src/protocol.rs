//! Wire format for session messages.
//!
//! Every message starts with a two byte header:
//!
//! ```text
//! [type: u8][version: u8][body]
//! ```
//!
//! Ordinary ratchet messages (`type = 2`) carry
//!
//! ```text
//! ratchet_key (33) || counter (u32 BE) || previous_counter (u32 BE) || ciphertext
//! ```
//!
//! Pre-key messages (`type = 3`) are sent until the initiator hears back
//! and wrap a complete ordinary message together with what the responder
//! needs to rebuild the handshake:
//!
//! ```text
//! registration_id (u32 BE) || has_pre_key (u8) || [pre_key_id (u32 BE)]
//!   || signed_pre_key_id (u32 BE) || base_key (33) || identity_key (33)
//!   || inner_len (u32 BE) || inner ordinary message
//! ```

use crate::crypto::TAG_SIZE;
use crate::error::{Error, Result};
use crate::keys::PublicKey;

/// Protocol version written into and required from every message.
pub const CIPHERTEXT_MESSAGE_CURRENT_VERSION: u8 = 3;

/// Type byte of an ordinary ratchet message.
pub const SIGNAL_MESSAGE_TYPE: u8 = 2;

/// Type byte of a pre-key message.
pub const PRE_KEY_SIGNAL_MESSAGE_TYPE: u8 = 3;

const HEADER_LEN: usize = 2;

/// Ordinary ratchet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    ratchet_key: PublicKey,
    counter: u32,
    previous_counter: u32,
    ciphertext: Vec<u8>,
}

impl SignalMessage {
    pub(crate) fn new(
        ratchet_key: PublicKey,
        counter: u32,
        previous_counter: u32,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            ratchet_key,
            counter,
            previous_counter,
            ciphertext,
        }
    }

    /// Sender's current ratchet public key.
    #[must_use]
    pub fn ratchet_key(&self) -> &PublicKey {
        &self.ratchet_key
    }

    /// Position of this message in the sender's chain.
    #[must_use]
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Length of the sender's previous sending chain.
    #[must_use]
    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    /// AEAD ciphertext including the authentication tag.
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Associated data bound into the AEAD tag.
    ///
    /// `sender_identity || receiver_identity || version || ratchet_key ||
    /// counter || previous_counter`
    pub(crate) fn associated_data(
        &self,
        sender_identity: &PublicKey,
        receiver_identity: &PublicKey,
    ) -> Vec<u8> {
        let mut ad = Vec::with_capacity(PublicKey::SERIALIZED_SIZE * 3 + 9);
        ad.extend_from_slice(&sender_identity.serialize());
        ad.extend_from_slice(&receiver_identity.serialize());
        ad.push(CIPHERTEXT_MESSAGE_CURRENT_VERSION);
        ad.extend_from_slice(&self.ratchet_key.serialize());
        ad.extend_from_slice(&self.counter.to_be_bytes());
        ad.extend_from_slice(&self.previous_counter.to_be_bytes());
        ad
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(HEADER_LEN + PublicKey::SERIALIZED_SIZE + 8 + self.ciphertext.len());
        bytes.push(SIGNAL_MESSAGE_TYPE);
        bytes.push(CIPHERTEXT_MESSAGE_CURRENT_VERSION);
        bytes.extend_from_slice(&self.ratchet_key.serialize());
        bytes.extend_from_slice(&self.counter.to_be_bytes());
        bytes.extend_from_slice(&self.previous_counter.to_be_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        reader.expect_header(SIGNAL_MESSAGE_TYPE)?;

        let ratchet_key = reader.public_key()?;
        let counter = reader.u32()?;
        let previous_counter = reader.u32()?;
        let ciphertext = reader.rest();

        if ciphertext.len() < TAG_SIZE {
            return Err(Error::InvalidMessage);
        }

        Ok(Self::new(
            ratchet_key,
            counter,
            previous_counter,
            ciphertext.to_vec(),
        ))
    }
}

/// First messages of a session, carrying the handshake parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeySignalMessage {
    registration_id: u32,
    pre_key_id: Option<u32>,
    signed_pre_key_id: u32,
    base_key: PublicKey,
    identity_key: PublicKey,
    message: SignalMessage,
}

impl PreKeySignalMessage {
    pub(crate) fn new(
        registration_id: u32,
        pre_key_id: Option<u32>,
        signed_pre_key_id: u32,
        base_key: PublicKey,
        identity_key: PublicKey,
        message: SignalMessage,
    ) -> Self {
        Self {
            registration_id,
            pre_key_id,
            signed_pre_key_id,
            base_key,
            identity_key,
            message,
        }
    }

    /// Sender's registration id.
    #[must_use]
    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    /// One-time pre-key used in the handshake, if any.
    #[must_use]
    pub fn pre_key_id(&self) -> Option<u32> {
        self.pre_key_id
    }

    #[must_use]
    pub fn signed_pre_key_id(&self) -> u32 {
        self.signed_pre_key_id
    }

    /// Initiator's base key; identifies the session it belongs to.
    #[must_use]
    pub fn base_key(&self) -> &PublicKey {
        &self.base_key
    }

    /// Initiator's identity key.
    #[must_use]
    pub fn identity_key(&self) -> &PublicKey {
        &self.identity_key
    }

    #[must_use]
    pub fn message(&self) -> &SignalMessage {
        &self.message
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let inner = self.message.serialize();
        let mut bytes = Vec::with_capacity(
            HEADER_LEN + 17 + PublicKey::SERIALIZED_SIZE * 2 + inner.len(),
        );

        bytes.push(PRE_KEY_SIGNAL_MESSAGE_TYPE);
        bytes.push(CIPHERTEXT_MESSAGE_CURRENT_VERSION);
        bytes.extend_from_slice(&self.registration_id.to_be_bytes());
        match self.pre_key_id {
            Some(id) => {
                bytes.push(1);
                bytes.extend_from_slice(&id.to_be_bytes());
            }
            None => bytes.push(0),
        }
        bytes.extend_from_slice(&self.signed_pre_key_id.to_be_bytes());
        bytes.extend_from_slice(&self.base_key.serialize());
        bytes.extend_from_slice(&self.identity_key.serialize());
        #[allow(clippy::cast_possible_truncation)]
        bytes.extend_from_slice(&(inner.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&inner);
        bytes
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        reader.expect_header(PRE_KEY_SIGNAL_MESSAGE_TYPE)?;

        let registration_id = reader.u32()?;
        let pre_key_id = match reader.u8()? {
            0 => None,
            1 => Some(reader.u32()?),
            _ => return Err(Error::InvalidMessage),
        };
        let signed_pre_key_id = reader.u32()?;
        let base_key = reader.public_key()?;
        let identity_key = reader.public_key()?;

        let inner_len = usize::try_from(reader.u32()?).map_err(|_| Error::InvalidMessage)?;
        let inner = reader.take(inner_len)?;
        if !reader.rest().is_empty() {
            return Err(Error::InvalidMessage);
        }

        Ok(Self::new(
            registration_id,
            pre_key_id,
            signed_pre_key_id,
            base_key,
            identity_key,
            SignalMessage::deserialize(inner)?,
        ))
    }
}

/// Any message produced by the session cipher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiphertextMessage {
    /// Sent until the initiator has received a reply.
    PreKey(PreKeySignalMessage),
    /// Ordinary ratchet message.
    Signal(SignalMessage),
}

impl CiphertextMessage {
    /// Leading type byte of the serialized form.
    #[must_use]
    pub fn message_type(&self) -> u8 {
        match self {
            Self::PreKey(_) => PRE_KEY_SIGNAL_MESSAGE_TYPE,
            Self::Signal(_) => SIGNAL_MESSAGE_TYPE,
        }
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::PreKey(message) => message.serialize(),
            Self::Signal(message) => message.serialize(),
        }
    }

    /// Parses a message, dispatching on its type byte.
    ///
    /// # Errors
    /// - `Error::UnsupportedMessageType` for an unknown type byte
    /// - `Error::UnsupportedVersion` for any version other than the current one
    /// - `Error::InvalidMessage` for truncated or malformed input
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        match bytes.first() {
            None => Err(Error::InvalidMessage),
            Some(&PRE_KEY_SIGNAL_MESSAGE_TYPE) => {
                PreKeySignalMessage::deserialize(bytes).map(Self::PreKey)
            }
            Some(&SIGNAL_MESSAGE_TYPE) => SignalMessage::deserialize(bytes).map(Self::Signal),
            Some(&other) => Err(Error::UnsupportedMessageType(other)),
        }
    }
}

/// Cursor over a message body; running out of bytes is `InvalidMessage`.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn expect_header(&mut self, message_type: u8) -> Result<()> {
        let found = self.u8()?;
        if found != message_type {
            return Err(Error::UnsupportedMessageType(found));
        }

        let version = self.u8()?;
        if version != CIPHERTEXT_MESSAGE_CURRENT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < len {
            return Err(Error::InvalidMessage);
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(
            bytes.try_into().map_err(|_| Error::InvalidMessage)?,
        ))
    }

    fn public_key(&mut self) -> Result<PublicKey> {
        PublicKey::deserialize(self.take(PublicKey::SERIALIZED_SIZE)?)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.bytes)
    }
}
