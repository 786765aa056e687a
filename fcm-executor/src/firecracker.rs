//! Firecracker control client.
//!
//! Drives one VM through the Firecracker Management API (HTTP over a Unix
//! domain socket). The wire is abstracted by [`ApiTransport`] so the
//! configuration sequence can be checked against a fake VMM.
//!
//! # API Reference
//! Firecracker API spec: `firecracker/src/api_server/swagger/firecracker.yaml`

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
pub use hyper::Method;
use serde::Deserialize;
use serde_json::Value;

use crate::ExecutorError;

/// Interval between readiness probes.
const READY_POLL: Duration = Duration::from_millis(100);

/// Raw HTTP answer from the API socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    /// `true` for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `fault_message` Firecracker puts in error bodies, or the raw body.
    #[must_use]
    pub fn fault(&self) -> String {
        serde_json::from_str::<Value>(&self.body)
            .ok()
            .and_then(|v| v.get("fault_message").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or_else(|| self.body.trim().to_owned())
    }
}

/// Sends one API request to the VMM listening on `socket`.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// # Errors
    /// Returns [`ExecutorError::ExternalTool`] if nothing answers on the
    /// socket or the exchange fails. HTTP error statuses are not errors.
    async fn request(
        &self,
        socket: &Path,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<ApiResponse, ExecutorError>;
}

/// Metadata service attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct MmdsSpec {
    /// Host TAP device backing the guest's `mmds0`.
    pub device: String,
    /// Address the metadata service answers on inside the guest.
    pub address: Ipv4Addr,
    /// Full MMDS document.
    pub metadata: Value,
}

/// Everything [`FirecrackerClient::apply_configuration`] sends.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSpec {
    pub vcpus: u8,
    pub memory_mib: u32,
    pub kernel: PathBuf,
    pub boot_args: String,
    pub rootfs: PathBuf,
    /// Host TAP device backing the guest's `eth0`.
    pub tap_device: String,
    pub mmds: Option<MmdsSpec>,
}

/// One drive as reported by `GET /vm/config`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DriveView {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    #[serde(default)]
    pub is_root_device: bool,
    #[serde(default)]
    pub is_read_only: bool,
}

/// One network interface as reported by `GET /vm/config`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InterfaceView {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(default)]
    pub guest_mac: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MachineConfigView {
    vcpu_count: u8,
    mem_size_mib: u32,
}

#[derive(Debug, Deserialize)]
struct BootSourceView {
    kernel_image_path: PathBuf,
    #[serde(default)]
    boot_args: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "machine-config")]
    machine_config: Option<MachineConfigView>,
    #[serde(rename = "boot-source")]
    boot_source: Option<BootSourceView>,
    #[serde(default)]
    drives: Vec<DriveView>,
    #[serde(rename = "network-interfaces", default)]
    network_interfaces: Vec<InterfaceView>,
}

/// Live VM configuration, with drives and interfaces keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSnapshot {
    pub vcpus: Option<u8>,
    pub memory_mib: Option<u32>,
    pub kernel: Option<PathBuf>,
    pub boot_args: Option<String>,
    pub drives: BTreeMap<String, DriveView>,
    pub interfaces: BTreeMap<String, InterfaceView>,
}

impl ConfigSnapshot {
    fn from_raw(raw: RawConfig) -> Self {
        Self {
            vcpus: raw.machine_config.as_ref().map(|m| m.vcpu_count),
            memory_mib: raw.machine_config.as_ref().map(|m| m.mem_size_mib),
            kernel: raw.boot_source.as_ref().map(|b| b.kernel_image_path.clone()),
            boot_args: raw.boot_source.and_then(|b| b.boot_args),
            drives: raw.drives.into_iter().map(|d| (d.drive_id.clone(), d)).collect(),
            interfaces: raw
                .network_interfaces
                .into_iter()
                .map(|i| (i.iface_id.clone(), i))
                .collect(),
        }
    }

    /// Host path of the `rootfs` drive.
    #[must_use]
    pub fn rootfs(&self) -> Option<&Path> {
        self.drives.get("rootfs").map(|d| d.path_on_host.as_path())
    }

    /// Host TAP device behind guest interface `iface_id`.
    #[must_use]
    pub fn host_device(&self, iface_id: &str) -> Option<&str> {
        self.interfaces.get(iface_id).map(|i| i.host_dev_name.as_str())
    }
}

/// Control client for the VMM behind one API socket.
pub struct FirecrackerClient<T: ApiTransport> {
    transport: Arc<T>,
    socket: PathBuf,
}

impl<T: ApiTransport> FirecrackerClient<T> {
    /// Binds a client to `socket`.
    #[must_use]
    pub fn new(transport: Arc<T>, socket: PathBuf) -> Self {
        Self { transport, socket }
    }

    /// The API socket this client talks to.
    #[must_use]
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// `true` if a VMM answers on the socket with any HTTP status.
    pub async fn is_responsive(&self) -> bool {
        self.transport.request(&self.socket, Method::GET, "/", None).await.is_ok()
    }

    /// Polls [`Self::is_responsive`] until it succeeds or `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_responsive().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn put(&self, step: &'static str, body: &Value) -> Result<(), ExecutorError> {
        let path = format!("/{step}");
        tracing::debug!(socket = %self.socket.display(), %path, "configuring VM");
        let response = self
            .transport
            .request(&self.socket, Method::PUT, &path, Some(body.to_string()))
            .await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(ExecutorError::Api {
                step,
                reason: format!("HTTP {}: {}", response.status, response.fault()),
            })
        }
    }

    async fn get(&self, step: &'static str) -> Result<Value, ExecutorError> {
        let response = self
            .transport
            .request(&self.socket, Method::GET, &format!("/{step}"), None)
            .await?;
        if !response.is_success() {
            return Err(ExecutorError::Api {
                step,
                reason: format!("HTTP {}: {}", response.status, response.fault()),
            });
        }
        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    /// Sends the pre-boot configuration in a fixed order, stopping at the
    /// first rejected step.
    ///
    /// # Errors
    /// - [`ExecutorError::Api`] naming the rejected step
    /// - [`ExecutorError::ExternalTool`] on transport failure
    pub async fn apply_configuration(&self, spec: &MachineSpec) -> Result<(), ExecutorError> {
        self.put(
            "machine-config",
            &serde_json::json!({ "vcpu_count": spec.vcpus, "mem_size_mib": spec.memory_mib }),
        )
        .await?;

        self.put(
            "boot-source",
            &serde_json::json!({
                "kernel_image_path": spec.kernel,
                "boot_args": spec.boot_args,
            }),
        )
        .await?;

        self.put(
            "drives/rootfs",
            &serde_json::json!({
                "drive_id": "rootfs",
                "path_on_host": spec.rootfs,
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await?;

        self.put(
            "network-interfaces/eth0",
            &serde_json::json!({ "iface_id": "eth0", "host_dev_name": spec.tap_device }),
        )
        .await?;

        if let Some(mmds) = &spec.mmds {
            self.put(
                "network-interfaces/mmds0",
                &serde_json::json!({ "iface_id": "mmds0", "host_dev_name": mmds.device }),
            )
            .await?;
            self.put(
                "mmds/config",
                &serde_json::json!({
                    "network_interfaces": ["mmds0"],
                    "ipv4_address": mmds.address.to_string(),
                }),
            )
            .await?;
            self.put("mmds", &mmds.metadata).await?;
        }

        tracing::info!(socket = %self.socket.display(), "VM configuration applied");
        Ok(())
    }

    /// Boots the configured guest. Never retried.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Api`] with step `actions` if rejected.
    pub async fn start_instance(&self) -> Result<(), ExecutorError> {
        self.put("actions", &serde_json::json!({ "action_type": "InstanceStart" }))
            .await?;
        tracing::info!(socket = %self.socket.display(), "instance started");
        Ok(())
    }

    /// Reads the live configuration with `GET /vm/config`.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Api`] on HTTP errors and
    /// [`ExecutorError::Serde`] if the document cannot be decoded.
    pub async fn read_configuration(&self) -> Result<ConfigSnapshot, ExecutorError> {
        let value = self.get("vm/config").await?;
        let raw: RawConfig = serde_json::from_value(value)?;
        Ok(ConfigSnapshot::from_raw(raw))
    }

    /// Reads the MMDS document with `GET /mmds`.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Api`] on HTTP errors.
    pub async fn read_metadata(&self) -> Result<Value, ExecutorError> {
        self.get("mmds").await
    }
}
