//! Per-VM root filesystem files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::host::{HostCommand, Invocation};
use crate::ExecutorError;

/// Builds the writable disk file a VM boots from.
#[async_trait]
pub trait RootfsBuilder: Send + Sync {
    /// Produces `target` from `base_image`, sized to `size`.
    ///
    /// # Errors
    /// - [`ExecutorError::ResourceConflict`] if `target` exists and
    ///   `overwrite` is false
    /// - [`ExecutorError::Validation`] if `base_image` does not exist
    /// - [`ExecutorError::ExternalTool`] if resizing fails
    async fn build(
        &self,
        base_image: &Path,
        target: &Path,
        size: &str,
        overwrite: bool,
    ) -> Result<PathBuf, ExecutorError>;
}

/// Copies the base image and grows it with `resize2fs`.
///
/// A partially written target is removed on failure.
pub struct ImageCopyBuilder<H: HostCommand> {
    host: Arc<H>,
}

impl<H: HostCommand> ImageCopyBuilder<H> {
    #[must_use]
    pub fn new(host: Arc<H>) -> Self {
        Self { host }
    }

    async fn copy_and_resize(&self, base_image: &Path, target: &Path, size: &str) -> Result<(), ExecutorError> {
        let bytes = tokio::fs::copy(base_image, target).await?;
        tracing::debug!(image = %base_image.display(), target = %target.display(), bytes, "base image copied");
        let target_arg = target.display().to_string();
        self.host
            .run_ok(&Invocation::new("resize2fs", [target_arg.as_str(), size]))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<H: HostCommand> RootfsBuilder for ImageCopyBuilder<H> {
    async fn build(
        &self,
        base_image: &Path,
        target: &Path,
        size: &str,
        overwrite: bool,
    ) -> Result<PathBuf, ExecutorError> {
        if tokio::fs::try_exists(target).await? && !overwrite {
            return Err(ExecutorError::conflict(
                format!("rootfs {}", target.display()),
                "file exists; pass force_rootfs to replace it",
            ));
        }
        if !tokio::fs::try_exists(base_image).await? {
            return Err(ExecutorError::Validation(format!(
                "base image {} does not exist",
                base_image.display()
            )));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Err(e) = self.copy_and_resize(base_image, target, size).await {
            if let Err(rm) = tokio::fs::remove_file(target).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(target = %target.display(), error = %rm, "failed to remove partial rootfs");
                }
            }
            return Err(e);
        }

        tracing::info!(rootfs = %target.display(), %size, "rootfs built");
        Ok(target.to_path_buf())
    }
}
