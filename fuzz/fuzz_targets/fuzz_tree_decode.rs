//! Fuzz target for tree object decoding.

#![no_main]

use grove_storage::TreeEntry;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(entries) = TreeEntry::decode(data) else {
        return;
    };
    for entry in &entries {
        assert!(!entry.name.contains('\0'));
        let _ = entry.mode.as_str();
    }
});
