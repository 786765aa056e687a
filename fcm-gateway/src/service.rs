//! Object-safe view of the orchestrator used as router state.

use async_trait::async_trait;
use fcm_core::{CreateRequest, VmName, VmState};
use fcm_executor::{
    ApiTransport, AssumeAnswer, CreateDefaults, CreateMode, CreateReport, DestroyOutcome, ExecutorError, HostCommand,
    InstanceHandle, Orchestrator, RootfsBuilder, Supervisor, VmRow,
};

/// Lifecycle operations the HTTP layer needs.
#[async_trait]
pub trait VmService: Send + Sync {
    /// Values used for create fields the caller left out.
    fn defaults(&self) -> &CreateDefaults;

    async fn state(&self, name: &VmName) -> Result<VmState, ExecutorError>;

    async fn create(&self, request: &CreateRequest) -> Result<CreateReport, ExecutorError>;

    async fn stop(&self, name: &VmName) -> Result<(), ExecutorError>;

    async fn start(&self, name: &VmName) -> Result<InstanceHandle, ExecutorError>;

    async fn restart(&self, name: &VmName) -> Result<InstanceHandle, ExecutorError>;

    /// Destroys without asking; the route only calls this when forced.
    async fn destroy(&self, name: &VmName) -> Result<DestroyOutcome, ExecutorError>;

    async fn list(&self) -> Result<Vec<VmRow>, ExecutorError>;
}

#[async_trait]
impl<H, T, S, R> VmService for Orchestrator<H, T, S, R>
where
    H: HostCommand,
    T: ApiTransport,
    S: Supervisor,
    R: RootfsBuilder,
{
    fn defaults(&self) -> &CreateDefaults {
        &self.settings().defaults
    }

    async fn state(&self, name: &VmName) -> Result<VmState, ExecutorError> {
        Orchestrator::state(self, name).await
    }

    async fn create(&self, request: &CreateRequest) -> Result<CreateReport, ExecutorError> {
        Orchestrator::create(self, request, CreateMode::Supervised).await
    }

    async fn stop(&self, name: &VmName) -> Result<(), ExecutorError> {
        Orchestrator::stop(self, name).await
    }

    async fn start(&self, name: &VmName) -> Result<InstanceHandle, ExecutorError> {
        Orchestrator::start(self, name).await
    }

    async fn restart(&self, name: &VmName) -> Result<InstanceHandle, ExecutorError> {
        Orchestrator::restart(self, name).await
    }

    async fn destroy(&self, name: &VmName) -> Result<DestroyOutcome, ExecutorError> {
        Orchestrator::destroy(self, name, true, &AssumeAnswer(true)).await
    }

    async fn list(&self) -> Result<Vec<VmRow>, ExecutorError> {
        self.list_all().await
    }
}
