//! Core types for the Firecracker VM manager.
//!
//! Defines the domain types shared by the executor, the gateway and the CLI:
//! VM names, create requests, persisted resource records and MMDS metadata
//! composition. Nothing here touches the host.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod examples;
pub mod id;
pub mod metadata;
pub mod record;
pub mod request;

pub use error::CoreError;
pub use id::{validate_device_name, VmName};
pub use metadata::NetworkConfig;
pub use record::{NetworkDriver, VmRecord, VmState};
pub use request::{CreateRequest, NetworkRequest};
