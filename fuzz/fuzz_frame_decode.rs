//! Fuzz target for the control-protocol frame decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_frame_decode
//!
//! Any input must either fail cleanly or decode to a frame whose payload
//! is exactly the declared length, and re-encoding it must reproduce the
//! input prefix apart from the reserved word.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vnids_core::codec::{self, HEADER_LEN};

fuzz_target!(|data: &[u8]| {
    if let Ok((header, payload)) = codec::decode(data) {
        assert_eq!(payload.len(), header.length as usize);
        let frame = codec::encode(&header, payload).expect("decoded frame must re-encode");
        assert_eq!(frame[..12], data[..12]);
        assert_eq!(frame[HEADER_LEN..], data[HEADER_LEN..header.frame_len()]);
    }
});
