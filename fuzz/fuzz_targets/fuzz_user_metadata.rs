//! Fuzz target: caller-supplied MMDS metadata.
//!
//! Parsing must never panic, and whatever parses must survive composition
//! with the injected network configuration.

#![no_main]

use std::net::Ipv4Addr;

use fcm_core::metadata::{compose, guest_ip, parse_user_metadata};
use fcm_core::NetworkConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(user) = parse_user_metadata(text) {
        let network = NetworkConfig {
            ip: Ipv4Addr::new(172, 16, 0, 2),
            gateway: Ipv4Addr::new(172, 16, 0, 1),
            hostname: "fuzz".to_owned(),
        };
        let doc = compose(&user, &network);
        assert_eq!(guest_ip(&doc), Some(network.ip), "injected network_config always wins");
    }
});
