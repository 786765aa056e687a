//! Example create requests demonstrating the schema.
//!
//! The three requests cover both network drivers:
//! `web` (internal, generated devices), `db` (internal, explicit devices)
//! and `edge` (external, pre-provisioned devices).

use std::net::Ipv4Addr;

use serde_json::Map;

use crate::id::VmName;
use crate::request::{CreateRequest, NetworkRequest};

/// Builds an internal-mode request for `name` with generated devices.
///
/// `octet` selects the /30 the VM lives in: the TAP address is
/// `172.16.<octet>.1` and the guest `172.16.<octet>.2`.
///
/// # Panics
/// Panics if `name` is not a valid VM name.
#[must_use]
pub fn example_request(name: &str, octet: u8) -> CreateRequest {
    let name = match VmName::new(name) {
        Ok(n) => n,
        Err(e) => panic!("example VM name must be valid: {e}"),
    };
    CreateRequest {
        name,
        kernel: "vmlinux-6.1".to_owned(),
        image: "ubuntu-24.04.ext4".to_owned(),
        rootfs_size: "1G".to_owned(),
        vm_ip: Ipv4Addr::new(172, 16, octet, 2),
        tap_ip: Ipv4Addr::new(172, 16, octet, 1),
        cpus: 2,
        memory: 1024,
        hostname: None,
        metadata: Map::new(),
        network: NetworkRequest::internal(),
        force_rootfs: false,
    }
}

/// Returns the three canonical example requests.
#[must_use]
pub fn example_requests() -> Vec<CreateRequest> {
    let web = example_request("web", 0);

    let mut db = example_request("db", 1);
    db.network = NetworkRequest::Internal {
        tap_device: Some("tap10".to_owned()),
        mmds_tap: Some("tap11".to_owned()),
    };
    db.cpus = 4;
    db.memory = 4096;
    db.metadata.insert("role".to_owned(), serde_json::json!("database"));

    let mut edge = example_request("edge", 2);
    edge.network = NetworkRequest::External {
        tap_device: "ext-edge0".to_owned(),
        mmds_tap: "ext-edge-md".to_owned(),
    };
    edge.hostname = Some("edge.internal".to_owned());

    vec![web, db, edge]
}
