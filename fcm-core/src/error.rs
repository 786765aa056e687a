/// Errors produced by the `fcm-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A VM name cannot be used as a file stem or supervisor program name.
    #[error("invalid VM name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// A request or record field failed validation.
    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// Caller-supplied MMDS metadata is not a JSON object.
    #[error("invalid metadata: {reason}")]
    InvalidMetadata { reason: String },
}

impl CoreError {
    pub(crate) fn field(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidField { field: field.to_owned(), reason: reason.into() }
    }
}
