//! Fuzz target for decrypting arbitrary bytes on an established session
//!
//! Garbage must be rejected without panicking and without touching the
//! stored session.

#![no_main]

use halo_e2e::{
    InMemoryProtocolStore, ProtocolAddress, ProtocolStore, SessionBuilder, SessionCipher,
    create_pre_key_bundle,
};
use libfuzzer_sys::fuzz_target;
use rand::SeedableRng;
use rand::rngs::StdRng;

fuzz_target!(|data: &[u8]| {
    let mut rng = StdRng::seed_from_u64(0);
    let alice = InMemoryProtocolStore::generate(&mut rng);
    let bob = InMemoryProtocolStore::generate(&mut rng);
    let alice_address = ProtocolAddress::new("alice", 1);
    let bob_address = ProtocolAddress::new("bob", 1);

    let bundle = create_pre_key_bundle(&bob, 1, &mut rng).unwrap();
    SessionBuilder::new(&alice, bob_address.clone())
        .process(&mut rng, &bundle)
        .unwrap();

    let alice_cipher = SessionCipher::new(&alice, bob_address);
    let bob_cipher = SessionCipher::new(&bob, alice_address.clone());
    let hello = alice_cipher.encrypt(b"hello").unwrap();
    bob_cipher.decrypt(&mut rng, &hello).unwrap();

    let before = format!("{:?}", bob.load_session(&alice_address).unwrap());
    if bob_cipher.decrypt_bytes(&mut rng, data).is_err() {
        let after = format!("{:?}", bob.load_session(&alice_address).unwrap());
        assert_eq!(before, after);
    }
});
