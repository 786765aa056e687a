//! Fuzz target: JSON deserialization of `CreateVmBody`.
//!
//! Verifies that arbitrary byte sequences fed to the gateway's create body
//! parser never panic, and that accepted bodies always carry a valid name.

#![no_main]

use fcm_gateway::routes::CreateVmBody;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(body) = serde_json::from_slice::<CreateVmBody>(data) {
        assert!(fcm_core::VmName::new(body.name.as_str()).is_ok());
    }
});
