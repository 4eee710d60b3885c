//! End-to-end encrypted messaging core for two parties.
//!
//! This crate implements an X3DH-style pre-key handshake and a Double
//! Ratchet session cipher on top of a pluggable protocol store. It provides
//! forward secrecy, post-compromise security and replay protection for
//! asynchronous messaging.
//!
//! # Security Properties
//!
//! ## Forward Secrecy
//! Every message is encrypted under its own message key, derived from a
//! one-way chain and erased once used. Compromising today's state does not
//! reveal yesterday's messages.
//!
//! ## Post-Compromise Security
//! Each time the direction of conversation flips, both sides mix a fresh
//! Diffie-Hellman output into the root key.
//!
//! ## Asynchronous Operation
//! A sender can start a session with an offline recipient from a
//! [`PreKeyBundle`] published in advance.
//!
//! # Threat Model
//!
//! **Assumed adversary capabilities:**
//! - Active network attacker (inject, modify, replay, reorder, drop messages)
//! - Later compromise of long-term identity keys
//!
//! **Security assumptions:**
//! - X25519 ECDH provides computational security
//! - HKDF-SHA256 and HMAC-SHA256 are secure key derivation functions
//! - ChaCha20-Poly1305 is a secure AEAD cipher
//! - The injected random number generator is cryptographically secure
//!
//! # Protocol Flow
//!
//! ```rust
//! use halo_e2e::{
//!     InMemoryProtocolStore, ProtocolAddress, SessionBuilder, SessionCipher,
//!     create_pre_key_bundle,
//! };
//! use rand_core::OsRng;
//!
//! let alice_store = InMemoryProtocolStore::generate(&mut OsRng);
//! let bob_store = InMemoryProtocolStore::generate(&mut OsRng);
//! let alice_address = ProtocolAddress::new("+6879111111", 1);
//! let bob_address = ProtocolAddress::new("+6879222222", 1);
//!
//! // Bob publishes a bundle; Alice starts a session from it
//! let bundle = create_pre_key_bundle(&bob_store, 1, &mut OsRng)?;
//! SessionBuilder::new(&alice_store, bob_address.clone()).process(&mut OsRng, &bundle)?;
//!
//! // Alice's first message carries the handshake parameters
//! let alice = SessionCipher::new(&alice_store, bob_address);
//! let message = alice.encrypt(b"Hello Bob!")?;
//!
//! // Decrypting it creates Bob's side of the session
//! let bob = SessionCipher::new(&bob_store, alice_address);
//! assert_eq!(bob.decrypt(&mut OsRng, &message)?, b"Hello Bob!");
//!
//! // From here on both directions use ordinary ratchet messages
//! let reply = bob.encrypt(b"Hello Alice!")?;
//! assert_eq!(alice.decrypt_bytes(&mut OsRng, &reply.serialize())?, b"Hello Alice!");
//! # Ok::<(), halo_e2e::Error>(())
//! ```
//!
//! # Modules
//!
//! - [`session_builder`]: pre-key handshake
//! - [`session_cipher`]: Double Ratchet encryption and decryption
//! - [`protocol`]: wire format
//! - [`bundle`]: pre-key records and bundles
//! - [`store`]: storage abstraction and in-memory store
//! - [`state`]: per-session ratchet state
//! - [`crypto`]: cryptographic primitives (KDF, AEAD encryption)
//! - [`keys`]: key types with automatic zeroization
//! - [`xeddsa`]: signatures with X25519 keys
//! - [`config`]: session limits
//! - [`error`]: error types

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unreachable_pub)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    missing_docs,
    clippy::missing_errors_doc,
    clippy::missing_fields_in_debug,
    clippy::module_name_repetitions
)]

pub mod address;
pub mod bundle;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod session_builder;
pub mod session_cipher;
pub mod state;
pub mod store;
pub mod xeddsa;

// Re-export main types
pub use address::ProtocolAddress;
pub use bundle::{PreKeyBundle, PreKeyRecord, SignedPreKeyRecord, create_pre_key_bundle};
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use keys::{IdentityKeyPair, KeyPair, PublicKey, SecretKey};
pub use protocol::{CiphertextMessage, PreKeySignalMessage, SignalMessage};
pub use session_builder::SessionBuilder;
pub use session_cipher::SessionCipher;
pub use state::{SessionRecord, SessionState};
pub use store::{InMemoryProtocolStore, ProtocolStore};
