//! Declarative create requests.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::id::{validate_device_name, VmName};
use crate::record::NetworkDriver;

/// Highest vCPU count Firecracker accepts.
pub const MAX_VCPUS: u8 = 32;

/// How the VM's two TAP devices are obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum NetworkRequest {
    /// The manager owns the devices. Omitted names are generated.
    Internal {
        #[serde(default)]
        tap_device: Option<String>,
        #[serde(default)]
        mmds_tap: Option<String>,
    },
    /// The devices already exist, carry the TAP address and route the guest IP.
    External { tap_device: String, mmds_tap: String },
}

impl NetworkRequest {
    /// Internal mode with generated device names.
    #[must_use]
    pub fn internal() -> Self {
        Self::Internal { tap_device: None, mmds_tap: None }
    }

    /// The driver this request maps to.
    #[must_use]
    pub fn driver(&self) -> NetworkDriver {
        match self {
            Self::Internal { .. } => NetworkDriver::Internal,
            Self::External { .. } => NetworkDriver::External,
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        let (primary, mmds) = match self {
            Self::Internal { tap_device, mmds_tap } => (tap_device.as_deref(), mmds_tap.as_deref()),
            Self::External { tap_device, mmds_tap } => (Some(tap_device.as_str()), Some(mmds_tap.as_str())),
        };
        if let Some(primary) = primary {
            validate_device_name("tap_device", primary)?;
        }
        if let Some(mmds) = mmds {
            validate_device_name("mmds_tap", mmds)?;
        }
        if let (Some(primary), Some(mmds)) = (primary, mmds) {
            if primary == mmds {
                return Err(CoreError::field(
                    "mmds_tap",
                    format!("'{mmds}' is also the primary device; the two devices must differ"),
                ));
            }
        }
        Ok(())
    }
}

impl Default for NetworkRequest {
    fn default() -> Self {
        Self::internal()
    }
}

/// Everything needed to create one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Unique VM name.
    pub name: VmName,
    /// Kernel file name inside the kernel directory, or an absolute path.
    pub kernel: String,
    /// Base image file name inside the images directory.
    pub image: String,
    /// Target rootfs size in `resize2fs` notation (`512M`, `2G`, ...).
    pub rootfs_size: String,
    /// Guest IPv4 address.
    pub vm_ip: Ipv4Addr,
    /// Host side TAP address, used as the guest gateway.
    pub tap_ip: Ipv4Addr,
    /// Number of vCPUs.
    pub cpus: u8,
    /// Guest memory in MiB.
    pub memory: u32,
    /// Guest hostname; defaults to the VM name.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Extra MMDS metadata merged under the injected `network_config`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// TAP device ownership and names.
    #[serde(default)]
    pub network: NetworkRequest,
    /// Replace an existing rootfs file instead of failing.
    #[serde(default)]
    pub force_rootfs: bool,
}

impl CreateRequest {
    /// The hostname the guest will see.
    #[must_use]
    pub fn effective_hostname(&self) -> &str {
        self.hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.name.as_str())
    }

    /// Checks every field that can be checked without touching the host.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidField`] naming the first offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.kernel.trim().is_empty() {
            return Err(CoreError::field("kernel", "a kernel image is required"));
        }
        if self.image.trim().is_empty() {
            return Err(CoreError::field("image", "a base image is required"));
        }
        if self.image.contains('/') {
            return Err(CoreError::field("image", "must be a file name inside the images directory"));
        }
        validate_rootfs_size(&self.rootfs_size)?;
        if self.cpus == 0 || self.cpus > MAX_VCPUS {
            return Err(CoreError::field("cpus", format!("must be between 1 and {MAX_VCPUS}")));
        }
        if self.memory == 0 {
            return Err(CoreError::field("memory", "must be at least 1 MiB"));
        }
        for (field, ip) in [("vm_ip", self.vm_ip), ("tap_ip", self.tap_ip)] {
            if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() || ip.is_loopback() {
                return Err(CoreError::field(field, format!("{ip} is not a usable unicast address")));
            }
        }
        if self.vm_ip == self.tap_ip {
            return Err(CoreError::field("vm_ip", "guest and TAP addresses must differ"));
        }
        if let Some(hostname) = &self.hostname {
            if hostname.len() > 253 || hostname.chars().any(char::is_whitespace) {
                return Err(CoreError::field("hostname", format!("'{hostname}' is not a valid hostname")));
            }
        }
        self.network.validate()
    }
}

/// Accepts the size notation understood by `resize2fs`: digits with an
/// optional `K`, `M`, `G`, `T` or `s` (512-byte sectors) suffix.
///
/// # Errors
/// Returns [`CoreError::InvalidField`] for anything else.
pub fn validate_rootfs_size(size: &str) -> Result<(), CoreError> {
    let digits = size.strip_suffix(['K', 'M', 'G', 'T', 's']).unwrap_or(size);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(CoreError::field(
            "rootfs_size",
            format!("'{size}' is not a size like 512M or 2G"),
        ));
    }
    if digits.chars().all(|c| c == '0') {
        return Err(CoreError::field("rootfs_size", "size must be greater than zero"));
    }
    Ok(())
}
