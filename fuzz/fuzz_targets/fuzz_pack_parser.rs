//! Fuzz target for pack parsing, deltas included.

#![no_main]

use grove_storage::ObjectStore;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut store = ObjectStore::new();
    let mut parser = grove_git::PackParser::new(data);
    if let Ok(ids) = parser.parse(&mut store) {
        for id in ids {
            assert!(store.contains(&id));
        }
    }

    // Deltas reach the parser from remotes too; exercise them on their own.
    if let Some((split, rest)) = data.split_first() {
        let at = usize::from(*split).min(rest.len());
        let (base, delta) = rest.split_at(at);
        let _ = grove_git::apply_delta(base, delta);
    }
});
