//! Fuzz target: JSON decoding of cached `VmRecord` files.
//!
//! Records are read back from disk on stop/start/destroy and may have been
//! edited or truncated. Decoding must fail cleanly, never panic.

#![no_main]

use fcm_core::VmRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = serde_json::from_slice::<VmRecord>(data) {
        let _ = record.missing_fields();
        let _ = record.devices();
    }
});
