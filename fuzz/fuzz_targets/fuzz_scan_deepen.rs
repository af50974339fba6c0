//! Fuzz target for the advisory `deepen` scan.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let found = gitway_git::scan_deepen(Cursor::new(data));
    if found {
        assert!(data.windows(6).any(|w| w == b"deepen"));
    }
});
