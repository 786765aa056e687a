//! Fuzz target: `ip` output parsers used by the TAP allocator.
//!
//! Link and address listings come from the host and must never make the
//! allocator panic, whatever the tool prints.

#![no_main]

use fcm_executor::network::{parse_inet_addrs, parse_link_names, tap_index};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    for name in parse_link_names(&text) {
        assert!(!name.is_empty(), "parsed device names are never empty");
        assert!(!name.contains('@'), "peer suffixes are stripped");
        let _ = tap_index(&name, "tap");
    }
    for (_, prefix) in parse_inet_addrs(&text) {
        assert!(prefix <= 32);
    }
});
