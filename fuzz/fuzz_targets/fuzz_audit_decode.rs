//! Fuzz target: audit record decoding
//!
//! Feeds arbitrary bytes to `decode_record` and verifies:
//! - No panics under arbitrary input
//! - Anything that decodes re-encodes to bytes that decode to the same
//!   record
//!
//! cargo fuzz run fuzz_audit_decode

#![no_main]

use aidloop::audit::{decode_record, encode_record};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(record) = decode_record(data) else {
        return;
    };
    let bytes = encode_record(&record).expect("decoded record must encode");
    let again = decode_record(&bytes).expect("re-encoded record must decode");
    // NaN fields never compare equal, so compare the canonical bytes.
    assert_eq!(encode_record(&again).expect("encode"), bytes);
});
