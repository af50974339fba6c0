//! Fuzz target for pkt-line decoding.
//!
//! The reader must never panic and never claim more bytes than it was given.

#![no_main]

use gitway_git::PktLineReader;
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut reader = PktLineReader::new(Cursor::new(data));
    let mut consumed = 0;

    // A packet is at least four bytes, so this bounds the loop.
    for _ in 0..=data.len() / 4 {
        match reader.read() {
            Ok(Some(pkt)) => consumed += pkt.wire_len(),
            Ok(None) | Err(_) => break,
        }
    }

    assert!(consumed <= data.len());
});
