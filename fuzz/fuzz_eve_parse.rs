//! Fuzz target for the EVE line parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_eve_parse
//!
//! Parsing must never panic, and every accepted alert must carry a
//! severity in 1..=5.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vnids_core::event::{EveLine, parse_line};

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(EveLine::Event(record)) = parse_line(line) {
        if let Some(severity) = record.severity() {
            assert!((1..=5).contains(&severity.get()));
        }
    }
});
