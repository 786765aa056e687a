//! Error types for the executor crate.

use fcm_core::CoreError;

/// Coarse classification of an [`ExecutorError`], used by callers to pick an
/// exit code or HTTP status and by the orchestrator to decide on rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing parameters; nothing was mutated.
    Validation,
    /// A socket, device, rootfs file or record is already taken.
    ResourceConflict,
    /// A host command or supervisor call failed or timed out.
    ExternalTool,
    /// The hypervisor rejected a configuration step.
    Api,
    /// The operation does not fit the VM's lifecycle state.
    State,
    /// The operation was interrupted by the operator.
    Interrupted,
    /// Local I/O or encoding failure.
    Internal,
}

/// Errors that can occur during VM lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// Bad or missing parameters, or a failed pre-flight check.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A host resource is already in use.
    #[error("{resource} is already in use: {reason}")]
    ResourceConflict { resource: String, reason: String },

    /// A host command or supervisor control call failed or timed out.
    #[error("{tool} failed: {reason}")]
    ExternalTool { tool: String, reason: String },

    /// Firecracker rejected a configuration step.
    #[error("Firecracker rejected {step}: {reason}")]
    Api { step: &'static str, reason: String },

    /// The operation is invalid for the VM's current lifecycle state.
    #[error("VM '{vm}': {reason}")]
    State { vm: String, reason: String },

    /// The operator interrupted a foreground operation.
    #[error("interrupted; resources were rolled back")]
    Interrupted,

    /// Domain validation error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Record encoding or decoding failed.
    #[error("record encoding: {0}")]
    Serde(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Returns the error's classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Core(_) => ErrorKind::Validation,
            Self::ResourceConflict { .. } => ErrorKind::ResourceConflict,
            Self::ExternalTool { .. } => ErrorKind::ExternalTool,
            Self::Api { .. } => ErrorKind::Api,
            Self::State { .. } => ErrorKind::State,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::Serde(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn conflict(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceConflict { resource: resource.into(), reason: reason.into() }
    }

    pub(crate) fn tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExternalTool { tool: tool.into(), reason: reason.into() }
    }

    pub(crate) fn state(vm: impl ToString, reason: impl Into<String>) -> Self {
        Self::State { vm: vm.to_string(), reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classifies_core_errors_as_validation() {
        let err = ExecutorError::from(CoreError::InvalidMetadata { reason: "x".to_owned() });
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn api_error_names_the_step() {
        let err = ExecutorError::Api { step: "boot-source", reason: "kernel missing".to_owned() };
        let msg = err.to_string();
        assert!(msg.contains("boot-source"), "message must carry the step: {msg}");
        assert!(msg.contains("kernel missing"), "message must carry the reason: {msg}");
        assert_eq!(err.kind(), ErrorKind::Api);
    }
}
