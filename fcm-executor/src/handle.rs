//! Instance handle: identifies a running Firecracker process.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fcm_core::VmName;

/// How the Firecracker process behind a VM is tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessIdentity {
    /// A supervisord program of this name.
    Program(String),
    /// A child of the manager process.
    Child { pid: Option<u32> },
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Program(name) => write!(f, "program:{name}"),
            Self::Child { pid: Some(pid) } => write!(f, "pid:{pid}"),
            Self::Child { pid: None } => f.write_str("pid:exited"),
        }
    }
}

/// A handle to a running Firecracker microVM.
///
/// Never persisted: whether a VM runs is decided by probing its socket.
/// Dropping the handle does NOT stop the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct InstanceHandle {
    /// VM the process serves.
    pub name: VmName,

    /// Path to the Firecracker API Unix socket.
    pub socket_path: PathBuf,

    /// Supervisor program or child process.
    pub process: ProcessIdentity,

    /// Timestamp when the process was started.
    pub started_at: DateTime<Utc>,
}

impl InstanceHandle {
    /// Create a new instance handle.
    #[must_use]
    pub fn new(name: VmName, socket_path: PathBuf, process: ProcessIdentity) -> Self {
        Self { name, socket_path, process, started_at: Utc::now() }
    }
}
