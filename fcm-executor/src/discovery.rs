//! Listing VMs by merging live VMM state with the record cache.
//!
//! A responsive socket makes the VMM authoritative for that row; otherwise
//! the row comes from the record alone. One broken VM never fails the list.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use fcm_core::{metadata, NetworkDriver, VmName, VmRecord};
use serde::Serialize;

use crate::firecracker::ApiTransport;
use crate::host::HostCommand;
use crate::orchestrator::Orchestrator;
use crate::rootfs::RootfsBuilder;
use crate::supervisor::Supervisor;
use crate::ExecutorError;

/// Lifecycle state shown in a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowState {
    Running,
    Stopped,
    /// The record could not be read.
    Unknown,
}

/// One line of `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmRow {
    pub name: String,
    pub state: RowState,
    pub vcpus: Option<u8>,
    pub memory: Option<u32>,
    pub rootfs: Option<PathBuf>,
    pub tap_device: Option<String>,
    pub mmds_tap: Option<String>,
    pub vm_ip: Option<Ipv4Addr>,
    pub tap_ip: Option<Ipv4Addr>,
    pub networkdriver: Option<NetworkDriver>,
    /// Why the row is incomplete or comes from the cache despite a live VMM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VmRow {
    fn from_record(record: &VmRecord, state: RowState) -> Self {
        Self {
            name: record.name.to_string(),
            state,
            vcpus: Some(record.cpus),
            memory: Some(record.memory),
            rootfs: Some(record.rootfs.clone()),
            tap_device: Some(record.tap_device.clone()),
            mmds_tap: Some(record.mmds_tap.clone()),
            vm_ip: Some(record.vm_ip),
            tap_ip: Some(record.tap_ip),
            networkdriver: Some(record.networkdriver),
            error: None,
        }
    }

    fn unreadable(name: &VmName, error: &ExecutorError) -> Self {
        Self {
            name: name.to_string(),
            state: RowState::Unknown,
            vcpus: None,
            memory: None,
            rootfs: None,
            tap_device: None,
            mmds_tap: None,
            vm_ip: None,
            tap_ip: None,
            networkdriver: None,
            error: Some(error.to_string()),
        }
    }
}

/// A responsive API socket found in the socket directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningVm {
    pub name: String,
    pub socket: PathBuf,
}

impl<H, T, S, R> Orchestrator<H, T, S, R>
where
    H: HostCommand,
    T: ApiTransport,
    S: Supervisor,
    R: RootfsBuilder,
{
    /// One row per record, sorted by name.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] only if the record directory itself
    /// cannot be read.
    pub async fn list_all(&self) -> Result<Vec<VmRow>, ExecutorError> {
        let mut rows = Vec::new();
        for name in self.store.names().await? {
            let record = match self.store.load(&name).await {
                Ok(Some(record)) => record,
                // Deleted between listing the directory and reading it.
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(vm = %name, error = %e, "unreadable record");
                    rows.push(VmRow::unreadable(&name, &e));
                    continue;
                }
            };
            rows.push(self.row(&record).await);
        }
        Ok(rows)
    }

    async fn row(&self, record: &VmRecord) -> VmRow {
        let client = self.client(&self.settings.socket_path(&record.name));
        if !client.is_responsive().await {
            return VmRow::from_record(record, RowState::Stopped);
        }
        match self.live_row(record).await {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(vm = %record.name, error = %e, "live state unavailable; showing cached values");
                let mut row = VmRow::from_record(record, RowState::Running);
                row.error = Some(e.to_string());
                row
            }
        }
    }

    async fn live_row(&self, record: &VmRecord) -> Result<VmRow, ExecutorError> {
        let client = self.client(&self.settings.socket_path(&record.name));
        let config = client.read_configuration().await?;
        let doc = client.read_metadata().await?;
        let tap_device = config.host_device("eth0").map(str::to_owned);
        let tap_ip = match &tap_device {
            Some(device) => self.network.device_ipv4(device).await?,
            None => None,
        };
        Ok(VmRow {
            name: record.name.to_string(),
            state: RowState::Running,
            vcpus: config.vcpus,
            memory: config.memory_mib,
            rootfs: config.rootfs().map(PathBuf::from),
            mmds_tap: config.host_device("mmds0").map(str::to_owned),
            tap_device,
            vm_ip: metadata::guest_ip(&doc),
            tap_ip,
            networkdriver: Some(record.networkdriver),
            error: None,
        })
    }

    /// Responsive `*.sock` files in the socket directory, sorted, whether or
    /// not a record exists for them.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] if the socket directory cannot be read.
    pub async fn list_running(&self) -> Result<Vec<RunningVm>, ExecutorError> {
        let mut entries = match tokio::fs::read_dir(&self.settings.socket_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut running = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let socket = entry.path();
            let Some(name) = socket
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".sock"))
                .map(str::to_owned)
            else {
                continue;
            };
            if self.client(&socket).is_responsive().await {
                running.push(RunningVm { name, socket });
            }
        }
        running.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(running)
    }
}
