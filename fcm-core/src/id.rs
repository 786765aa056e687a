use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Longest VM name accepted. Names end up in socket paths, which are bounded
/// by `sun_path`.
pub const MAX_NAME_LEN: usize = 64;

/// Longest host interface name (`IFNAMSIZ` minus the trailing NUL).
pub const MAX_DEVICE_NAME_LEN: usize = 15;

/// Unique name of a managed VM.
///
/// The name keys the resource record, the socket file, the rootfs file and the
/// supervisor program section, so it is restricted to `[A-Za-z0-9_.-]` and may
/// not start with `.` or `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VmName(String);

impl VmName {
    /// Validates and wraps a VM name.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidName`] if the name is empty, too long,
    /// starts with `.` or `-`, or contains characters outside `[A-Za-z0-9_.-]`.
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        let reject = |reason: &str| CoreError::InvalidName {
            name: name.clone(),
            reason: reason.to_owned(),
        };

        if name.is_empty() {
            return Err(reject("name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(reject("name is longer than 64 characters"));
        }
        if name.starts_with('.') || name.starts_with('-') {
            return Err(reject("name must not start with '.' or '-'"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(reject("only ASCII letters, digits, '_', '.' and '-' are allowed"));
        }
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for VmName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for VmName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VmName> for String {
    fn from(name: VmName) -> Self {
        name.0
    }
}

impl AsRef<str> for VmName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Checks that `name` is usable as a host network interface name.
///
/// # Errors
/// Returns [`CoreError::InvalidField`] naming `field` when the name is empty,
/// longer than 15 bytes, or contains `/`, `:` or whitespace.
pub fn validate_device_name(field: &str, name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::field(field, "device name must not be empty"));
    }
    if name.len() > MAX_DEVICE_NAME_LEN {
        return Err(CoreError::field(
            field,
            format!("device name '{name}' is longer than {MAX_DEVICE_NAME_LEN} bytes"),
        ));
    }
    if name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(CoreError::field(
            field,
            format!("device name '{name}' contains '/', ':' or whitespace"),
        ));
    }
    Ok(())
}
