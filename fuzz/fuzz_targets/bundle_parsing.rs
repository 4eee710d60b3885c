#![no_main]

use halo_e2e::PreKeyBundle;
use halo_e2e::keys::PublicKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Serialized public keys carry a type byte
    let _ = PublicKey::deserialize(data);

    // Arbitrary encoded bundles must decode or fail cleanly
    if let Ok(bundle) = PreKeyBundle::from_bytes(data) {
        // Verification should not panic, will almost always fail
        let _ = bundle.verify_signature();

        let encoded = bundle.to_bytes().unwrap();
        assert_eq!(PreKeyBundle::from_bytes(&encoded).unwrap(), bundle);
    }
});
