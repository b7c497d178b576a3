//! Fuzz target for ref advertisement parsing.

#![no_main]

use grove_git::{Advertisement, PktLineReader};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut reader = PktLineReader::new(Cursor::new(data));
    if let Ok(advertisement) = Advertisement::read(&mut reader) {
        for r in &advertisement.refs {
            assert!(advertisement.find(&r.name).is_some());
        }
        let _ = advertisement.supports("side-band-64k");
    }
});
