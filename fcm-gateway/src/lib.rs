//! HTTP API gateway for the Firecracker VM manager.
//!
//! Exposes create/stop/start/restart/destroy/list over JSON so the lifecycle
//! orchestrator can be driven remotely. Destroy requires `?force=true`
//! because an HTTP client cannot be prompted for confirmation.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod routes;
pub mod service;
