//! MMDS metadata composition.
//!
//! The guest always receives a `network_config` object describing its own
//! addressing; caller metadata is merged around it.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Key under which the injected network description is published.
pub const NETWORK_CONFIG_KEY: &str = "network_config";

/// Addressing published to the guest through MMDS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Guest address.
    pub ip: Ipv4Addr,
    /// Host TAP address the guest routes through.
    pub gateway: Ipv4Addr,
    /// Guest hostname.
    pub hostname: String,
}

/// Parses caller metadata given as a JSON document.
///
/// # Errors
/// Returns [`CoreError::InvalidMetadata`] if the text is not JSON or the
/// document is not an object.
pub fn parse_user_metadata(text: &str) -> Result<Map<String, Value>, CoreError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| CoreError::InvalidMetadata { reason: e.to_string() })?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(CoreError::InvalidMetadata {
            reason: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
    }
}

/// Builds the full MMDS document: `user` plus an injected `network_config`.
///
/// A caller-supplied `network_config` key is replaced.
#[must_use]
pub fn compose(user: &Map<String, Value>, network: &NetworkConfig) -> Value {
    let mut doc = user.clone();
    doc.insert(
        NETWORK_CONFIG_KEY.to_owned(),
        serde_json::json!({
            "ip": network.ip.to_string(),
            "gateway": network.gateway.to_string(),
            "hostname": network.hostname,
        }),
    );
    Value::Object(doc)
}

/// Reads the guest IP back out of an MMDS document.
#[must_use]
pub fn guest_ip(doc: &Value) -> Option<Ipv4Addr> {
    doc.get(NETWORK_CONFIG_KEY)?
        .get("ip")?
        .as_str()?
        .parse()
        .ok()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
