#![no_main]

use halo_e2e::keys::PublicKey;
use halo_e2e::xeddsa::{SIGNATURE_LENGTH, XEdDSAPublicKey};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Try to verify arbitrary signatures with arbitrary public keys
    if data.len() >= 32 + SIGNATURE_LENGTH {
        let public_bytes: [u8; 32] = data[0..32].try_into().unwrap();
        let signature: [u8; SIGNATURE_LENGTH] = data[32..32 + SIGNATURE_LENGTH].try_into().unwrap();
        let message = &data[32 + SIGNATURE_LENGTH..];

        let public_key = PublicKey::from_bytes(public_bytes);

        // Conversion may fail for invalid points
        if let Ok(xeddsa_public) = XEdDSAPublicKey::from_x25519_public(&public_key) {
            let _ = xeddsa_public.verify(message, &signature);
        }

        // Same path through the key type
        let _ = public_key.verify_signature(message, &signature);
    }
});
