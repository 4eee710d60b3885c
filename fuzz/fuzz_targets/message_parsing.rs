//! Fuzz target for wire message parsing
//!
//! Tests that arbitrary message data doesn't cause panics or undefined behavior

#![no_main]

use halo_e2e::CiphertextMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // If it parses successfully, the serialized form must parse to the same message
    if let Ok(message) = CiphertextMessage::deserialize(data) {
        let serialized = message.serialize();
        assert_eq!(serialized[0], message.message_type());

        let roundtrip = CiphertextMessage::deserialize(&serialized).unwrap();
        assert_eq!(message, roundtrip);
    }
});
