use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::VmName;
use crate::request::CreateRequest;

/// Who owns a VM's TAP devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDriver {
    /// The manager creates the devices on `create` and deletes them on `destroy`.
    #[default]
    Internal,
    /// The devices are provisioned by someone else and only validated.
    External,
}

impl NetworkDriver {
    /// Returns `true` if the manager creates and deletes the devices.
    #[must_use]
    pub fn owns_devices(self) -> bool {
        matches!(self, Self::Internal)
    }
}

impl fmt::Display for NetworkDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Lifecycle state of a VM as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// No record and no process.
    Absent,
    /// Host resources are being allocated.
    Provisioning,
    /// The hypervisor process is up and accepted the configuration.
    Configured,
    /// The guest is booted.
    Running,
    /// The record exists but no process answers on the socket.
    Stopped,
    /// All resources and the record were removed.
    Destroyed,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Provisioning => "provisioning",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Durable description of one VM, sufficient to rebuild its hypervisor
/// configuration without the original create request.
///
/// Records are written once at the end of a successful `create`, read by
/// `start`/`stop`/`list`, and removed by `destroy`. They are never patched in
/// place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmRecord {
    /// Unique VM name.
    pub name: VmName,
    /// Absolute path of the guest kernel image.
    pub kernel: PathBuf,
    /// Absolute path of the VM's own root filesystem file.
    pub rootfs: PathBuf,
    /// Base image the rootfs was built from.
    #[serde(default)]
    pub base_image: Option<String>,
    /// Primary TAP device (guest `eth0`).
    pub tap_device: String,
    /// TAP device dedicated to the metadata service (guest `mmds0`).
    pub mmds_tap: String,
    /// Guest IPv4 address.
    pub vm_ip: Ipv4Addr,
    /// Host side address assigned to the primary TAP device; the guest gateway.
    pub tap_ip: Ipv4Addr,
    /// Number of vCPUs.
    pub cpus: u8,
    /// Guest memory in MiB.
    pub memory: u32,
    /// Guest hostname published through MMDS.
    pub hostname: String,
    /// Device ownership mode. Older records without it are `internal`.
    #[serde(default)]
    pub networkdriver: NetworkDriver,
    /// Caller-supplied MMDS metadata, without the injected `network_config`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// When the VM was created.
    pub created_at: DateTime<Utc>,
}

impl VmRecord {
    /// Builds the record for a VM created from `request`.
    ///
    /// # Arguments
    /// - `kernel`: resolved absolute kernel path
    /// - `rootfs`: path of the rootfs file built for this VM
    /// - `tap_device`, `mmds_tap`: the devices allocated or validated for it
    #[must_use]
    pub fn from_request(
        request: &CreateRequest,
        kernel: PathBuf,
        rootfs: PathBuf,
        tap_device: String,
        mmds_tap: String,
    ) -> Self {
        Self {
            name: request.name.clone(),
            kernel,
            rootfs,
            base_image: Some(request.image.clone()),
            tap_device,
            mmds_tap,
            vm_ip: request.vm_ip,
            tap_ip: request.tap_ip,
            cpus: request.cpus,
            memory: request.memory,
            hostname: request.effective_hostname().to_owned(),
            networkdriver: request.network.driver(),
            metadata: request.metadata.clone(),
            created_at: Utc::now(),
        }
    }

    /// Returns the names of fields that are present but unusable for
    /// rebuilding the VM configuration (empty paths, zero resources, ...).
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.kernel.as_os_str().is_empty() {
            missing.push("kernel");
        }
        if self.rootfs.as_os_str().is_empty() {
            missing.push("rootfs");
        }
        if self.tap_device.is_empty() {
            missing.push("tap_device");
        }
        if self.mmds_tap.is_empty() {
            missing.push("mmds_tap");
        }
        if self.vm_ip.is_unspecified() {
            missing.push("vm_ip");
        }
        if self.tap_ip.is_unspecified() {
            missing.push("tap_ip");
        }
        if self.cpus == 0 {
            missing.push("cpus");
        }
        if self.memory == 0 {
            missing.push("memory");
        }
        missing
    }

    /// Both TAP devices, primary first.
    #[must_use]
    pub fn devices(&self) -> [&str; 2] {
        [&self.tap_device, &self.mmds_tap]
    }
}
