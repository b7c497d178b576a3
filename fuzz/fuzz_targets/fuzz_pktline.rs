//! Fuzz target for pkt-line framing.

#![no_main]

use grove_git::{PktLine, PktLineReader};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut reader = PktLineReader::new(Cursor::new(data));

    // Bounded so crafted input of empty packets cannot spin forever.
    for _ in 0..256 {
        match reader.read() {
            Ok(Some(PktLine::Data(payload))) => {
                // Anything read back must re-encode to the same frame.
                let encoded = PktLine::Data(payload.clone()).encode();
                assert_eq!(&encoded[4..], payload.as_slice());
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
});
