//! Two parties set up a session from published bundles and exchange a short
//! conversation.
//!
//! Run with `RUST_LOG=halo_e2e=debug` to see the library's own logging.

use halo_e2e::{
    InMemoryProtocolStore, ProtocolAddress, ProtocolStore, Result, SessionBuilder, SessionCipher,
    create_pre_key_bundle,
};
use rand_core::OsRng;
use tracing_subscriber::EnvFilter;

const CONVERSATION: [&str; 5] = [
    "Hello world! Welcome to HALO E2E Example!",
    "Is this E2E actually working???",
    "I dont know. Why dont you go and try it out?",
    "That's a wonderful idea. But this look so easy. What else could it be?",
    "Save it for later. This is just the beginning!",
];

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== HALO E2E Exchange ===\n");

    println!("1. Generating identities...");
    let alice_store = InMemoryProtocolStore::generate(&mut OsRng);
    let bob_store = InMemoryProtocolStore::generate(&mut OsRng);
    let alice_address = ProtocolAddress::new("+6879111111", 1);
    let bob_address = ProtocolAddress::new("+6879222222", 1);
    println!(
        "   ✓ Alice (registration {}) and Bob (registration {})\n",
        alice_store.local_registration_id(),
        bob_store.local_registration_id()
    );

    println!("2. Publishing pre-key bundles...");
    let alice_bundle = create_pre_key_bundle(&alice_store, alice_address.device_id(), &mut OsRng)?;
    let bob_bundle = create_pre_key_bundle(&bob_store, bob_address.device_id(), &mut OsRng)?;
    println!(
        "   ✓ Bob's bundle: signed pre-key {}, one-time pre-key {:?}\n",
        bob_bundle.signed_pre_key_id,
        bob_bundle.one_time_pre_key.map(|(id, _)| id)
    );

    println!("3. Both sides process the other's bundle...");
    SessionBuilder::new(&alice_store, bob_address.clone()).process(&mut OsRng, &bob_bundle)?;
    SessionBuilder::new(&bob_store, alice_address.clone()).process(&mut OsRng, &alice_bundle)?;
    println!("   ✓ Sessions initiated\n");

    let alice = SessionCipher::new(&alice_store, bob_address);
    let bob = SessionCipher::new(&bob_store, alice_address);

    println!("4. Exchanging messages...");
    for (i, text) in CONVERSATION.iter().enumerate() {
        let (sender, receiver, name) = if i % 2 == 0 {
            (&alice, &bob, "Alice")
        } else {
            (&bob, &alice, "Bob")
        };

        let message = sender.encrypt(text.as_bytes())?;
        let wire = message.serialize();
        let plaintext = receiver.decrypt_bytes(&mut OsRng, &wire)?;

        tracing::info!(
            from = name,
            message_type = message.message_type(),
            wire_len = wire.len(),
            "delivered"
        );
        println!("   {name}: {}", String::from_utf8_lossy(&plaintext));
    }

    println!(
        "\n   ✓ Session version {}, Bob sees Alice as registration {}",
        bob.session_version()?,
        bob.remote_registration_id()?
    );
    println!("   ✓ One-time pre-keys left with Bob: {}", bob_store.pre_key_count()?);

    Ok(())
}
