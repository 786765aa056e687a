//! Firecracker microVM lifecycle management on a single host.
//!
//! Allocates TAP devices, builds per-VM root filesystems, registers the
//! firecracker process with supervisord, configures the VMM over its API
//! socket and keeps a record of every VM so it can be stopped, restarted and
//! destroyed later without leaking host resources.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod discovery;
pub mod error;
pub mod firecracker;
pub mod handle;
pub mod host;
pub mod lock;
pub mod network;
pub mod orchestrator;
pub mod rootfs;
pub mod settings;
pub mod store;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod unix_client;

pub use discovery::{RowState, RunningVm, VmRow};
pub use error::{ErrorKind, ExecutorError};
pub use firecracker::{ApiResponse, ApiTransport, ConfigSnapshot, FirecrackerClient, MachineSpec, MmdsSpec};
pub use handle::{InstanceHandle, ProcessIdentity};
pub use host::{CommandOutput, HostCommand, Invocation, SystemHost};
pub use lock::AllocationLock;
pub use network::{TapAllocator, Teardown};
pub use orchestrator::{
    AssumeAnswer, Confirm, CreateMode, CreateReport, DestroyOutcome, DestroyPlan, DestroyReport, Interrupt,
    Orchestrator, SystemOrchestrator,
};
pub use rootfs::{ImageCopyBuilder, RootfsBuilder};
pub use settings::{CreateDefaults, Settings};
pub use store::RecordStore;
pub use supervisor::{ForegroundProcess, Supervisor, Supervisord};
pub use unix_client::UnixSocketTransport;
