//! Lifecycle orchestrator.
//!
//! Turns a create request into host side effects (rootfs, TAP devices,
//! supervised firecracker process, API configuration) and later stops,
//! starts and destroys the VM from its persisted record.
//!
//! Every operation is strictly sequential: each step is awaited before the
//! next one is issued. A failed `create` rolls back what it did; `destroy`
//! keeps the record until every cleanup step succeeded so it can be re-run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fcm_core::metadata::{self, NetworkConfig};
use fcm_core::{CreateRequest, NetworkDriver, NetworkRequest, VmName, VmRecord, VmState};
use serde::Serialize;
use tokio::sync::Notify;

use crate::firecracker::{ApiTransport, FirecrackerClient, MachineSpec, MmdsSpec};
use crate::handle::{InstanceHandle, ProcessIdentity};
use crate::host::{HostCommand, SystemHost};
use crate::lock::AllocationLock;
use crate::network::{TapAllocator, Teardown};
use crate::rootfs::{ImageCopyBuilder, RootfsBuilder};
use crate::settings::Settings;
use crate::store::RecordStore;
use crate::supervisor::{ForegroundProcess, Supervisor, Supervisord};
use crate::unix_client::UnixSocketTransport;
use crate::ExecutorError;

/// How the firecracker process of a new VM is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// As a supervisord program; `create` returns once the guest booted.
    Supervised,
    /// As a child of this process; `create` returns when the VM exits or
    /// the operator interrupts it.
    Foreground,
}

/// Outcome of a successful `create`.
#[derive(Debug)]
pub struct CreateReport {
    pub record: VmRecord,
    pub handle: InstanceHandle,
    /// Cleanup problems after a foreground run.
    pub warnings: Vec<String>,
}

/// What `destroy` is about to remove, shown to the operator for confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyPlan {
    pub name: VmName,
    pub rootfs: PathBuf,
    pub socket: PathBuf,
    pub networkdriver: NetworkDriver,
    /// TAP devices that will be deleted (internal mode).
    pub remove_devices: Vec<String>,
    /// TAP devices left in place (external mode).
    pub keep_devices: Vec<String>,
}

impl DestroyPlan {
    fn for_record(record: &VmRecord, socket: PathBuf) -> Self {
        let devices: Vec<String> = record.devices().iter().map(|d| (*d).to_owned()).collect();
        let (remove_devices, keep_devices) = if record.networkdriver.owns_devices() {
            (devices, Vec::new())
        } else {
            (Vec::new(), devices)
        };
        Self {
            name: record.name.clone(),
            rootfs: record.rootfs.clone(),
            socket,
            networkdriver: record.networkdriver,
            remove_devices,
            keep_devices,
        }
    }
}

/// Result of a completed destroy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestroyReport {
    pub name: VmName,
    pub removed_devices: Vec<String>,
    pub kept_devices: Vec<String>,
    /// Things that were already gone.
    pub warnings: Vec<String>,
}

/// What `destroy` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DestroyOutcome {
    /// No record exists for the name.
    NothingToDestroy,
    /// The operator declined.
    Cancelled,
    Destroyed(DestroyReport),
}

/// Asks the operator whether to go ahead with a destroy.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, plan: &DestroyPlan) -> bool;
}

/// Answers every confirmation with a fixed value.
#[derive(Debug, Clone, Copy)]
pub struct AssumeAnswer(pub bool);

#[async_trait]
impl Confirm for AssumeAnswer {
    async fn confirm(&self, _plan: &DestroyPlan) -> bool {
        self.0
    }
}

/// Side effects of an in-flight `create`, undone on failure.
#[derive(Default)]
struct Rollback {
    rootfs: Option<PathBuf>,
    owned_devices: Vec<String>,
    registered: bool,
    foreground: Option<ForegroundProcess>,
}

/// Removes `path`, treating a missing file as done. Returns `true` if a file
/// was removed.
async fn remove_file_if_present(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Where a foreground create hears that the operator wants it to stop.
#[derive(Debug, Clone, Default)]
pub enum Interrupt {
    /// SIGINT from the controlling terminal.
    #[default]
    CtrlC,
    /// An in-process trigger; `notify_one` interrupts the running create.
    Notify(Arc<Notify>),
}

impl Interrupt {
    async fn received(&self) {
        match self {
            Self::CtrlC => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "cannot listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            }
            Self::Notify(notify) => notify.notified().await,
        }
    }
}

fn note(warnings: &mut Vec<String>, vm: &VmName, message: String) {
    tracing::warn!(vm = %vm, "{message}");
    warnings.push(message);
}

/// The VM lifecycle state machine and the only writer of the record store.
pub struct Orchestrator<H, T, S, R>
where
    H: HostCommand,
    T: ApiTransport,
    S: Supervisor,
    R: RootfsBuilder,
{
    pub(crate) settings: Settings,
    pub(crate) transport: Arc<T>,
    pub(crate) supervisor: S,
    pub(crate) rootfs: R,
    pub(crate) network: TapAllocator<H>,
    pub(crate) store: RecordStore,
    pub(crate) interrupt: Interrupt,
}

/// Orchestrator wired to the real host.
pub type SystemOrchestrator =
    Orchestrator<SystemHost, UnixSocketTransport, Supervisord<SystemHost>, ImageCopyBuilder<SystemHost>>;

impl SystemOrchestrator {
    /// Wires `ip`, supervisord, `resize2fs` and the Unix socket API client
    /// according to `settings`.
    #[must_use]
    pub fn system(settings: Settings) -> Self {
        let host = Arc::new(SystemHost::new(settings.use_sudo, settings.command_timeout));
        let transport = Arc::new(UnixSocketTransport::new(settings.command_timeout));
        let supervisor = Supervisord::new(
            Arc::clone(&host),
            settings.supervisor_conf_dir.clone(),
            settings.log_dir.clone(),
            settings.firecracker_bin.clone(),
        );
        let rootfs = ImageCopyBuilder::new(Arc::clone(&host));
        Self::new(settings, host, transport, supervisor, rootfs)
    }
}

impl<H, T, S, R> Orchestrator<H, T, S, R>
where
    H: HostCommand,
    T: ApiTransport,
    S: Supervisor,
    R: RootfsBuilder,
{
    /// Assembles an orchestrator from its collaborators.
    #[must_use]
    pub fn new(settings: Settings, host: Arc<H>, transport: Arc<T>, supervisor: S, rootfs: R) -> Self {
        let network = TapAllocator::new(host, settings.tap_prefix.clone());
        let store = RecordStore::new(settings.cache_dir.clone());
        Self { settings, transport, supervisor, rootfs, network, store, interrupt: Interrupt::default() }
    }

    /// Replaces the Ctrl-C listener used in foreground mode.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Resolves on an interrupt in foreground mode; never otherwise.
    async fn interrupted(&self, mode: CreateMode) {
        match mode {
            CreateMode::Foreground => self.interrupt.received().await,
            CreateMode::Supervised => std::future::pending::<()>().await,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    #[must_use]
    pub fn network(&self) -> &TapAllocator<H> {
        &self.network
    }

    pub(crate) fn client(&self, socket: &Path) -> FirecrackerClient<T> {
        FirecrackerClient::new(Arc::clone(&self.transport), socket.to_path_buf())
    }

    /// The configuration sent to Firecracker for `record`, with the MMDS
    /// document rebuilt from the stored caller metadata.
    #[must_use]
    pub fn machine_spec(&self, record: &VmRecord) -> MachineSpec {
        let network = NetworkConfig {
            ip: record.vm_ip,
            gateway: record.tap_ip,
            hostname: record.hostname.clone(),
        };
        MachineSpec {
            vcpus: record.cpus,
            memory_mib: record.memory,
            kernel: record.kernel.clone(),
            boot_args: self.settings.boot_args.clone(),
            rootfs: record.rootfs.clone(),
            tap_device: record.tap_device.clone(),
            mmds: Some(MmdsSpec {
                device: record.mmds_tap.clone(),
                address: self.settings.mmds_address,
                metadata: metadata::compose(&record.metadata, &network),
            }),
        }
    }

    async fn remove_stale_socket(&self, socket: &Path) -> Result<(), ExecutorError> {
        if remove_file_if_present(socket).await? {
            tracing::info!(socket = %socket.display(), "removed stale socket file");
        }
        Ok(())
    }

    /// Creates and boots a VM.
    ///
    /// Nothing is touched until the request, the name, the socket and (in
    /// external mode) the devices check out. After that, any failure rolls
    /// back the rootfs, devices, process and socket this call created.
    ///
    /// # Errors
    /// - [`ExecutorError::Validation`] / [`ExecutorError::Core`] for bad input
    /// - [`ExecutorError::ResourceConflict`] if the name, socket, rootfs or
    ///   a device is taken
    /// - [`ExecutorError::ExternalTool`] / [`ExecutorError::Api`] if a step fails
    /// - [`ExecutorError::Interrupted`] on Ctrl-C in foreground mode
    pub async fn create(&self, request: &CreateRequest, mode: CreateMode) -> Result<CreateReport, ExecutorError> {
        request.validate()?;
        let name = &request.name;
        let socket = self.settings.socket_path(name);
        tracing::info!(vm = %name, driver = %request.network.driver(), ?mode, "creating VM");

        if self.store.load(name).await?.is_some() {
            return Err(ExecutorError::conflict(
                format!("VM '{name}'"),
                "a record already exists; destroy it first",
            ));
        }
        if self.client(&socket).is_responsive().await {
            return Err(ExecutorError::conflict(
                format!("socket {}", socket.display()),
                "a Firecracker process is answering on it",
            ));
        }
        let kernel = self.settings.resolve_kernel(&request.kernel)?;
        if let NetworkRequest::External { tap_device, mmds_tap } = &request.network {
            self.network
                .validate_external(tap_device, Some(request.tap_ip), Some(request.vm_ip))
                .await?;
            self.network.validate_external(mmds_tap, None, None).await?;
        }
        self.remove_stale_socket(&socket).await?;

        let base_image = self.settings.image_path(&request.image);
        let target = self.settings.rootfs_target(name);
        let rootfs = self
            .rootfs
            .build(&base_image, &target, &request.rootfs_size, request.force_rootfs)
            .await?;

        let mut rollback = Rollback { rootfs: Some(rootfs.clone()), ..Rollback::default() };
        let outcome = {
            let steps = self.provision_and_boot(request, &kernel, &rootfs, &socket, mode, &mut rollback);
            tokio::select! {
                result = steps => Some(result),
                () = self.interrupted(mode) => None,
            }
        };

        let (record, process) = match outcome {
            Some(Ok(done)) => done,
            Some(Err(e)) => {
                tracing::warn!(vm = %name, error = %e, "create failed");
                self.roll_back(name, &socket, rollback).await;
                return Err(e);
            }
            None => {
                tracing::warn!(vm = %name, "interrupted during create");
                self.roll_back(name, &socket, rollback).await;
                return Err(ExecutorError::Interrupted);
            }
        };

        let handle = InstanceHandle::new(name.clone(), socket.clone(), process);
        tracing::info!(vm = %name, process = %handle.process, tap = %record.tap_device, mmds = %record.mmds_tap, "VM created");

        let warnings = match rollback.foreground.take() {
            Some(mut child) => self.run_foreground(&record, &socket, &mut child).await,
            None => Vec::new(),
        };
        Ok(CreateReport { record, handle, warnings })
    }

    async fn provision_and_boot(
        &self,
        request: &CreateRequest,
        kernel: &Path,
        rootfs: &Path,
        socket: &Path,
        mode: CreateMode,
        rollback: &mut Rollback,
    ) -> Result<(VmRecord, ProcessIdentity), ExecutorError> {
        let name = &request.name;
        let lock = AllocationLock::acquire(&self.settings.lock_path()).await?;
        let (tap_device, mmds_tap) = match &request.network {
            NetworkRequest::Internal { tap_device, mmds_tap } => {
                let recorded = self.recorded_devices().await?;
                self.network
                    .allocate(tap_device.as_deref(), mmds_tap.as_deref(), &recorded)
                    .await?
            }
            NetworkRequest::External { tap_device, mmds_tap } => (tap_device.clone(), mmds_tap.clone()),
        };

        let process = match mode {
            CreateMode::Supervised => {
                rollback.registered = true;
                self.supervisor.ensure_registered(name, socket).await?;
                self.supervisor.start(name).await?;
                ProcessIdentity::Program(name.to_string())
            }
            CreateMode::Foreground => {
                let child = ForegroundProcess::spawn(&self.settings.firecracker_bin, name, socket)?;
                let pid = child.pid();
                rollback.foreground = Some(child);
                ProcessIdentity::Child { pid }
            }
        };

        let client = self.client(socket);
        if !client.wait_ready(self.settings.ready_timeout).await {
            return Err(ExecutorError::tool(
                "firecracker",
                format!(
                    "API socket {} not ready within {}s",
                    socket.display(),
                    self.settings.ready_timeout.as_secs()
                ),
            ));
        }

        if request.network.driver().owns_devices() {
            rollback.owned_devices = vec![tap_device.clone(), mmds_tap.clone()];
            self.network.provision(&tap_device, Some(request.tap_ip)).await?;
            self.network.provision(&mmds_tap, None).await?;
            self.network.add_route(request.vm_ip, &tap_device).await?;
        }
        drop(lock);

        let record = VmRecord::from_request(request, kernel.to_path_buf(), rootfs.to_path_buf(), tap_device, mmds_tap);
        client.apply_configuration(&self.machine_spec(&record)).await?;
        client.start_instance().await?;
        self.store.save(&record).await?;
        Ok((record, process))
    }

    /// Devices named by existing records. A stopped VM's devices may be gone
    /// from the host, but `start` will recreate them under these names.
    async fn recorded_devices(&self) -> Result<BTreeSet<String>, ExecutorError> {
        let mut devices = BTreeSet::new();
        for name in self.store.names().await? {
            match self.store.load(&name).await {
                Ok(Some(record)) => {
                    devices.extend(record.devices().into_iter().filter(|d| !d.is_empty()).map(str::to_owned));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(vm = %name, error = %e, "unreadable record; its devices are not reserved"),
            }
        }
        Ok(devices)
    }

    async fn roll_back(&self, name: &VmName, socket: &Path, mut rollback: Rollback) {
        let mut problems = Vec::new();
        if let Some(mut child) = rollback.foreground.take() {
            if let Err(e) = child.terminate().await {
                note(&mut problems, name, format!("rollback: stop firecracker: {e}"));
            }
        }
        if rollback.registered {
            if let Err(e) = self.supervisor.stop(name).await {
                note(&mut problems, name, format!("rollback: stop program: {e}"));
            }
            if let Err(e) = self.supervisor.unregister(name).await {
                note(&mut problems, name, format!("rollback: remove program: {e}"));
            }
        }
        if let Err(e) = remove_file_if_present(socket).await {
            note(&mut problems, name, format!("rollback: remove socket {}: {e}", socket.display()));
        }
        for device in &rollback.owned_devices {
            if let Err(e) = self.network.teardown(device).await {
                note(&mut problems, name, format!("rollback: remove TAP device {device}: {e}"));
            }
        }
        if let Some(rootfs) = &rollback.rootfs {
            if let Err(e) = remove_file_if_present(rootfs).await {
                note(&mut problems, name, format!("rollback: remove rootfs {}: {e}", rootfs.display()));
            }
        }
        tracing::info!(vm = %name, problems = problems.len(), "rollback finished");
    }

    /// Waits for a foreground VM to exit or be interrupted, then stops it and
    /// releases its socket and internal devices. The record is kept.
    async fn run_foreground(&self, record: &VmRecord, socket: &Path, child: &mut ForegroundProcess) -> Vec<String> {
        let name = &record.name;
        tracing::info!(vm = %name, "VM running in foreground; press Ctrl-C to stop");
        {
            let exited = child.wait();
            tokio::select! {
                status = exited => match status {
                    Ok(status) => tracing::info!(vm = %name, %status, "firecracker exited"),
                    Err(e) => tracing::warn!(vm = %name, error = %e, "lost track of firecracker"),
                },
                () = self.interrupted(CreateMode::Foreground) => tracing::info!(vm = %name, "interrupt received; stopping VM"),
            }
        }

        let mut warnings = Vec::new();
        if let Err(e) = child.terminate().await {
            note(&mut warnings, name, format!("stop firecracker: {e}"));
        }
        if let Err(e) = remove_file_if_present(socket).await {
            note(&mut warnings, name, format!("remove socket {}: {e}", socket.display()));
        }
        if record.networkdriver.owns_devices() {
            for device in record.devices() {
                match self.network.teardown(device).await {
                    Ok(Teardown::Removed) => {}
                    Ok(Teardown::Absent) => note(&mut warnings, name, format!("TAP device {device} was already gone")),
                    Err(e) => note(&mut warnings, name, format!("remove TAP device {device}: {e}")),
                }
            }
        }
        warnings
    }

    async fn require_record(&self, name: &VmName, hint: &str) -> Result<VmRecord, ExecutorError> {
        self.store
            .load(name)
            .await?
            .ok_or_else(|| ExecutorError::state(name, format!("no record exists; {hint}")))
    }

    /// Where `name` currently is in its lifecycle, from the record and a
    /// socket probe. A process answering without a record counts as running.
    ///
    /// # Errors
    /// Returns an error if the record exists but cannot be read.
    pub async fn state(&self, name: &VmName) -> Result<VmState, ExecutorError> {
        let has_record = self.store.load(name).await?.is_some();
        let responsive = self.client(&self.settings.socket_path(name)).is_responsive().await;
        Ok(match (has_record, responsive) {
            (_, true) => VmState::Running,
            (true, false) => VmState::Stopped,
            (false, false) => VmState::Absent,
        })
    }

    /// Stops the VM's process and removes its socket. Devices, rootfs and
    /// record stay. Stopping a stopped VM succeeds.
    ///
    /// # Errors
    /// - [`ExecutorError::State`] if there is no record
    /// - [`ExecutorError::ExternalTool`] if the supervisor refuses
    pub async fn stop(&self, name: &VmName) -> Result<(), ExecutorError> {
        self.require_record(name, "nothing to stop").await?;
        self.supervisor.stop(name).await?;
        let socket = self.settings.socket_path(name);
        if remove_file_if_present(&socket).await? {
            tracing::debug!(vm = %name, socket = %socket.display(), "socket removed");
        }
        tracing::info!(vm = %name, "VM stopped");
        Ok(())
    }

    /// Boots a stopped VM from its record.
    ///
    /// Internal devices are re-provisioned (a no-op if they still exist);
    /// external ones are only validated.
    ///
    /// # Errors
    /// - [`ExecutorError::State`] if there is no usable record or the VM runs
    /// - [`ExecutorError::Validation`] if external devices are not ready
    /// - [`ExecutorError::ExternalTool`] / [`ExecutorError::Api`] if a step fails
    pub async fn start(&self, name: &VmName) -> Result<InstanceHandle, ExecutorError> {
        let record = self.require_record(name, "create the VM first").await?;
        let missing = record.missing_fields();
        if !missing.is_empty() {
            return Err(ExecutorError::state(
                name,
                format!("record is incomplete; missing {}", missing.join(", ")),
            ));
        }
        let socket = self.settings.socket_path(name);
        let client = self.client(&socket);
        if client.is_responsive().await {
            return Err(ExecutorError::state(name, "is already running"));
        }
        self.remove_stale_socket(&socket).await?;

        match record.networkdriver {
            NetworkDriver::Internal => {
                self.network.provision(&record.tap_device, Some(record.tap_ip)).await?;
                self.network.provision(&record.mmds_tap, None).await?;
                self.network.add_route(record.vm_ip, &record.tap_device).await?;
            }
            NetworkDriver::External => {
                self.network
                    .validate_external(&record.tap_device, Some(record.tap_ip), Some(record.vm_ip))
                    .await?;
                self.network.validate_external(&record.mmds_tap, None, None).await?;
            }
        }

        if self.supervisor.ensure_registered(name, &socket).await? {
            tracing::info!(vm = %name, "supervisor program was missing and has been written");
        }

        let booted = async {
            self.supervisor.start(name).await?;
            if !client.wait_ready(self.settings.ready_timeout).await {
                return Err(ExecutorError::tool(
                    "firecracker",
                    format!("API socket {} not ready within {}s", socket.display(), self.settings.ready_timeout.as_secs()),
                ));
            }
            client.apply_configuration(&self.machine_spec(&record)).await?;
            client.start_instance().await
        }
        .await;

        if let Err(e) = booted {
            tracing::warn!(vm = %name, error = %e, "start failed; stopping process");
            if let Err(stop) = self.supervisor.stop(name).await {
                tracing::warn!(vm = %name, error = %stop, "failed to stop program after failed start");
            }
            if let Err(rm) = remove_file_if_present(&socket).await {
                tracing::warn!(vm = %name, error = %rm, "failed to remove socket after failed start");
            }
            return Err(e);
        }

        tracing::info!(vm = %name, "VM started");
        Ok(InstanceHandle::new(name.clone(), socket, ProcessIdentity::Program(name.to_string())))
    }

    /// `stop` followed by `start`; a failed stop aborts.
    ///
    /// # Errors
    /// Propagates the first failing step.
    pub async fn restart(&self, name: &VmName) -> Result<InstanceHandle, ExecutorError> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Removes the socket, internal devices, rootfs, supervisor program and
    /// finally the record.
    ///
    /// Without `force`, `confirm` is asked first. Cleanup steps run even if
    /// earlier ones fail; the record is only deleted if all of them succeeded.
    ///
    /// # Errors
    /// - [`ExecutorError::State`] if the VM is running or its record is unreadable
    /// - [`ExecutorError::ExternalTool`] listing the failed steps
    pub async fn destroy(
        &self,
        name: &VmName,
        force: bool,
        confirm: &dyn Confirm,
    ) -> Result<DestroyOutcome, ExecutorError> {
        let socket = self.settings.socket_path(name);
        if self.client(&socket).is_responsive().await {
            return Err(ExecutorError::state(name, "is running; stop it before destroying"));
        }
        let Some(record) = self.store.load(name).await? else {
            tracing::info!(vm = %name, "no record; nothing to destroy");
            return Ok(DestroyOutcome::NothingToDestroy);
        };

        let plan = DestroyPlan::for_record(&record, socket.clone());
        if !force && !confirm.confirm(&plan).await {
            tracing::info!(vm = %name, "destroy cancelled");
            return Ok(DestroyOutcome::Cancelled);
        }

        let mut failures = Vec::new();
        let mut warnings = Vec::new();
        let mut removed_devices = Vec::new();

        if let Err(e) = remove_file_if_present(&socket).await {
            failures.push(format!("remove socket {}: {e}", socket.display()));
        }
        for device in &plan.remove_devices {
            match self.network.teardown(device).await {
                Ok(Teardown::Removed) => removed_devices.push(device.clone()),
                Ok(Teardown::Absent) => note(&mut warnings, name, format!("TAP device {device} was already gone")),
                Err(e) => failures.push(format!("remove TAP device {device}: {e}")),
            }
        }
        match remove_file_if_present(&record.rootfs).await {
            Ok(true) => {}
            Ok(false) => note(&mut warnings, name, format!("rootfs {} was already gone", record.rootfs.display())),
            Err(e) => failures.push(format!("remove rootfs {}: {e}", record.rootfs.display())),
        }
        match self.supervisor.unregister(name).await {
            Ok(true) => {}
            Ok(false) => note(&mut warnings, name, "no supervisor program was registered".to_owned()),
            Err(e) => failures.push(format!("remove supervisor program: {e}")),
        }

        if !failures.is_empty() {
            for failure in &failures {
                tracing::warn!(vm = %name, "destroy step failed: {failure}");
            }
            return Err(ExecutorError::tool(
                "destroy",
                format!("record of '{name}' kept; failed steps: {}", failures.join("; ")),
            ));
        }

        self.store.delete(name).await?;
        tracing::info!(vm = %name, removed = ?removed_devices, "VM destroyed");
        Ok(DestroyOutcome::Destroyed(DestroyReport {
            name: name.clone(),
            removed_devices,
            kept_devices: plan.keep_devices,
            warnings,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, FakeVmm};
    use fcm_core::examples::example_request;

    struct NoRootfs;

    #[async_trait]
    impl RootfsBuilder for NoRootfs {
        async fn build(&self, _: &Path, target: &Path, _: &str, _: bool) -> Result<PathBuf, ExecutorError> {
            Ok(target.to_path_buf())
        }
    }

    fn orchestrator() -> Orchestrator<FakeHost, FakeVmm, FakeVmm, NoRootfs> {
        let vmm = FakeVmm::default();
        Orchestrator::new(
            Settings::default(),
            Arc::new(FakeHost::default()),
            Arc::new(vmm.clone()),
            vmm,
            NoRootfs,
        )
    }

    #[test]
    fn machine_spec_merges_stored_metadata_with_network_config() {
        let mut request = example_request("t1", 4);
        request.metadata.insert("role".to_owned(), serde_json::json!("web"));
        let record = VmRecord::from_request(
            &request,
            PathBuf::from("/k/vmlinux"),
            PathBuf::from("/r/t1.ext4"),
            "tap0".to_owned(),
            "tap1".to_owned(),
        );
        let spec = orchestrator().machine_spec(&record);
        assert_eq!(spec.tap_device, "tap0");
        assert_eq!(spec.boot_args, "console=ttyS0 reboot=k panic=1 pci=off");
        let Some(mmds) = spec.mmds else { panic!("MMDS must always be attached") };
        assert_eq!(mmds.device, "tap1");
        assert_eq!(mmds.metadata["role"], "web");
        assert_eq!(mmds.metadata["network_config"]["ip"], "172.16.4.2");
        assert_eq!(mmds.metadata["network_config"]["gateway"], "172.16.4.1");
        assert_eq!(mmds.metadata["network_config"]["hostname"], "t1");
    }

    #[test]
    fn destroy_plan_splits_devices_by_driver() {
        let mut record = VmRecord::from_request(
            &example_request("t1", 0),
            PathBuf::from("/k/vmlinux"),
            PathBuf::from("/r/t1.ext4"),
            "ext0".to_owned(),
            "ext1".to_owned(),
        );
        let plan = DestroyPlan::for_record(&record, PathBuf::from("/s/t1.sock"));
        assert_eq!(plan.remove_devices, vec!["ext0", "ext1"]);
        assert!(plan.keep_devices.is_empty());

        record.networkdriver = NetworkDriver::External;
        let plan = DestroyPlan::for_record(&record, PathBuf::from("/s/t1.sock"));
        assert!(plan.remove_devices.is_empty());
        assert_eq!(plan.keep_devices, vec!["ext0", "ext1"]);
    }

    #[tokio::test]
    async fn assume_answer_is_fixed() {
        let record = VmRecord::from_request(
            &example_request("t1", 0),
            PathBuf::new(),
            PathBuf::new(),
            String::new(),
            String::new(),
        );
        let plan = DestroyPlan::for_record(&record, PathBuf::new());
        assert!(AssumeAnswer(true).confirm(&plan).await);
        assert!(!AssumeAnswer(false).confirm(&plan).await);
    }
}
