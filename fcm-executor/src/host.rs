//! Host command port.
//!
//! Every external program the manager runs (`ip`, `supervisorctl`,
//! `resize2fs`) goes through [`HostCommand`], so the allocator and the
//! adapters can be exercised against an in-memory host in tests.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::ExecutorError;

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name or path.
    pub program: String,
    /// Arguments, without the program itself.
    pub args: Vec<String>,
    /// Needs root; adapters may prefix `sudo`.
    pub privileged: bool,
}

impl Invocation {
    /// An unprivileged invocation of `program` with `args`.
    #[must_use]
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_owned(),
            args: args.into_iter().map(Into::into).collect(),
            privileged: false,
        }
    }

    /// Marks the invocation as requiring root.
    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// The first `n` arguments joined by spaces, for matching in fakes and logs.
    #[must_use]
    pub fn head(&self, n: usize) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.args.iter().take(n).map(String::as_str));
        parts.join(" ")
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Exit status and captured streams of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// A successful output carrying `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { code: Some(0), stdout: stdout.into(), stderr: String::new() }
    }

    /// A failed output with exit code `code` and `stderr`.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self { code: Some(code), stdout: String::new(), stderr: stderr.into() }
    }

    /// `true` if the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Both streams, stdout first, for tools that report on either.
    #[must_use]
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Runs external programs on the host.
#[async_trait]
pub trait HostCommand: Send + Sync {
    /// Runs `invocation` to completion and captures its output.
    ///
    /// A non-zero exit is NOT an error here; callers inspect
    /// [`CommandOutput::success`].
    ///
    /// # Errors
    /// Returns [`ExecutorError::ExternalTool`] if the program cannot be
    /// spawned or does not finish in time.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecutorError>;

    /// Runs `invocation` and requires exit status 0, returning stdout.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ExternalTool`] carrying stderr on failure.
    async fn run_ok(&self, invocation: &Invocation) -> Result<String, ExecutorError> {
        let output = self.run(invocation).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(ExecutorError::tool(
                invocation.head(2),
                format!("`{invocation}` exited with {:?}: {}", output.code, output.stderr.trim()),
            ))
        }
    }
}

/// Runs real processes with `tokio::process`.
#[derive(Debug, Clone)]
pub struct SystemHost {
    use_sudo: bool,
    timeout: Duration,
}

impl SystemHost {
    /// Creates a host runner.
    ///
    /// # Arguments
    /// - `use_sudo`: prefix privileged invocations with `sudo`
    /// - `timeout`: upper bound for any single command
    #[must_use]
    pub fn new(use_sudo: bool, timeout: Duration) -> Self {
        Self { use_sudo, timeout }
    }
}

#[async_trait]
impl HostCommand for SystemHost {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecutorError> {
        let mut command = if invocation.privileged && self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(&invocation.program);
            c
        } else {
            Command::new(&invocation.program)
        };
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(command = %invocation, "running host command");

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                ExecutorError::tool(
                    &invocation.program,
                    format!("`{invocation}` did not finish within {}s", self.timeout.as_secs()),
                )
            })?
            .map_err(|e| ExecutorError::tool(&invocation.program, format!("spawn `{invocation}`: {e}")))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_display_and_head() {
        let inv = Invocation::new("ip", ["link", "del", "tap0"]).privileged();
        assert_eq!(inv.to_string(), "ip link del tap0");
        assert_eq!(inv.head(2), "ip link del");
        assert!(inv.privileged);
    }

    #[tokio::test]
    async fn system_host_captures_output() {
        let host = SystemHost::new(false, Duration::from_secs(5));
        let out = match host.run(&Invocation::new("echo", ["hello"])).await {
            Ok(o) => o,
            Err(e) => panic!("echo must run: {e}"),
        };
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn system_host_reports_nonzero_exit_without_error() {
        let host = SystemHost::new(false, Duration::from_secs(5));
        let out = match host.run(&Invocation::new("false", Vec::<String>::new())).await {
            Ok(o) => o,
            Err(e) => panic!("false must run: {e}"),
        };
        assert!(!out.success());
        assert!(host.run_ok(&Invocation::new("false", Vec::<String>::new())).await.is_err());
    }

    #[tokio::test]
    async fn system_host_times_out() {
        let host = SystemHost::new(false, Duration::from_millis(100));
        let err = match host.run(&Invocation::new("sleep", ["5"])).await {
            Ok(_) => panic!("sleep 5 must time out"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), crate::ErrorKind::ExternalTool);
    }

    #[tokio::test]
    async fn missing_program_is_external_tool_error() {
        let host = SystemHost::new(false, Duration::from_secs(1));
        let result = host.run(&Invocation::new("/nonexistent/fcm-tool", Vec::<String>::new())).await;
        assert!(matches!(result, Err(ExecutorError::ExternalTool { .. })));
    }
}
