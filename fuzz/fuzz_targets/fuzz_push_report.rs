//! Fuzz target for receive-pack status reports.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(report) = grove_git::decode_push_report(data) {
        for status in &report.statuses {
            assert!(report.status(&status.reference).is_some());
        }
        let _ = report.unpack_ok();
    }
});
