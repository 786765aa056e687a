//! Process supervision.
//!
//! In the normal mode each VM is a supervisord program whose definition
//! lives in `<conf_dir>/<name>.conf`. [`ForegroundProcess`] runs firecracker
//! as a direct child instead, for interactive debugging.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use fcm_core::VmName;
use tokio::process::{Child, Command};

use crate::host::{HostCommand, Invocation};
use crate::ExecutorError;

/// Manages the long-running firecracker process of each VM.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Makes sure a program definition for `name` serving `socket` exists
    /// and is loaded. Returns `true` if it had to be written.
    async fn ensure_registered(&self, name: &VmName, socket: &Path) -> Result<bool, ExecutorError>;

    /// Starts the program. Starting a running program succeeds.
    async fn start(&self, name: &VmName) -> Result<(), ExecutorError>;

    /// Stops the program. Stopping a program that is not running succeeds.
    async fn stop(&self, name: &VmName) -> Result<(), ExecutorError>;

    /// Removes the program definition and reloads. Returns `false` if there
    /// was none.
    async fn unregister(&self, name: &VmName) -> Result<bool, ExecutorError>;
}

/// supervisord adapter driven through `supervisorctl`.
pub struct Supervisord<H: HostCommand> {
    host: Arc<H>,
    conf_dir: PathBuf,
    log_dir: PathBuf,
    firecracker_bin: PathBuf,
}

impl<H: HostCommand> Supervisord<H> {
    /// # Arguments
    /// - `conf_dir`: supervisord include directory (`/etc/supervisor/conf.d`)
    /// - `log_dir`: where program stdout/stderr logs go
    /// - `firecracker_bin`: binary the program runs
    #[must_use]
    pub fn new(host: Arc<H>, conf_dir: PathBuf, log_dir: PathBuf, firecracker_bin: PathBuf) -> Self {
        Self { host, conf_dir, log_dir, firecracker_bin }
    }

    /// Path of the program definition for `name`.
    #[must_use]
    pub fn conf_path(&self, name: &VmName) -> PathBuf {
        self.conf_dir.join(format!("{name}.conf"))
    }

    /// Renders the `[program:<name>]` section.
    #[must_use]
    pub fn program_config(&self, name: &VmName, socket: &Path) -> String {
        format!(
            "[program:{name}]\n\
             command={bin} --id {name} --api-sock {socket}\n\
             stdout_logfile={log}/{name}.log\n\
             stderr_logfile={log}/{name}.error.log\n\
             autostart=true\n",
            bin = self.firecracker_bin.display(),
            socket = socket.display(),
            log = self.log_dir.display(),
        )
    }

    /// Runs `supervisorctl <args>`. Output containing one of `benign` counts
    /// as success whatever the exit status.
    async fn ctl(&self, args: &[&str], benign: &[&str]) -> Result<String, ExecutorError> {
        let invocation = Invocation::new("supervisorctl", args.iter().copied()).privileged();
        let output = self.host.run(&invocation).await?;
        let text = output.combined();
        if output.success() || benign.iter().any(|marker| text.contains(marker)) {
            Ok(text)
        } else {
            Err(ExecutorError::tool(
                "supervisorctl",
                format!("`{invocation}`: {}", text.trim()),
            ))
        }
    }

    async fn reload(&self) -> Result<(), ExecutorError> {
        self.ctl(&["update"], &[]).await.map(|_| ())
    }
}

#[async_trait]
impl<H: HostCommand> Supervisor for Supervisord<H> {
    async fn ensure_registered(&self, name: &VmName, socket: &Path) -> Result<bool, ExecutorError> {
        let path = self.conf_path(name);
        let wanted = self.program_config(name, socket);
        match tokio::fs::read_to_string(&path).await {
            Ok(current) if current == wanted => return Ok(false),
            Ok(_) => tracing::info!(vm = %name, conf = %path.display(), "rewriting outdated program definition"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::write(&path, wanted).await?;
        tracing::info!(vm = %name, conf = %path.display(), "supervisor program written");
        self.reload().await?;
        Ok(true)
    }

    async fn start(&self, name: &VmName) -> Result<(), ExecutorError> {
        self.ctl(&["start", name.as_str()], &["already started"]).await?;
        tracing::info!(vm = %name, "supervisor program started");
        Ok(())
    }

    async fn stop(&self, name: &VmName) -> Result<(), ExecutorError> {
        self.ctl(&["stop", name.as_str()], &["not running", "no such process"]).await?;
        tracing::info!(vm = %name, "supervisor program stopped");
        Ok(())
    }

    async fn unregister(&self, name: &VmName) -> Result<bool, ExecutorError> {
        let path = self.conf_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        tracing::info!(vm = %name, conf = %path.display(), "supervisor program removed");
        self.reload().await?;
        Ok(true)
    }
}

/// Firecracker running as a direct child with the terminal attached.
#[derive(Debug)]
pub struct ForegroundProcess {
    child: Child,
}

impl ForegroundProcess {
    /// Spawns `<binary> --id <name> --api-sock <socket>`.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ExternalTool`] if the binary cannot be executed.
    pub fn spawn(binary: &Path, name: &VmName, socket: &Path) -> Result<Self, ExecutorError> {
        let child = Command::new(binary)
            .arg("--id")
            .arg(name.as_str())
            .arg("--api-sock")
            .arg(socket)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::tool("firecracker", format!("exec {}: {e}", binary.display())))?;
        tracing::info!(vm = %name, pid = ?child.id(), "firecracker started in foreground");
        Ok(Self { child })
    }

    /// OS process id, while the child is alive.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the process to exit on its own.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] if waiting fails.
    pub async fn wait(&mut self) -> Result<ExitStatus, ExecutorError> {
        Ok(self.child.wait().await?)
    }

    /// Kills the process and reaps it. A process that already exited is fine.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] if the kill fails for another reason.
    pub async fn terminate(&mut self) -> Result<(), ExecutorError> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CommandOutput;
    use crate::testing::FakeHost;

    fn name(s: &str) -> VmName {
        match VmName::new(s) {
            Ok(n) => n,
            Err(e) => panic!("valid name: {e}"),
        }
    }

    fn supervisord(host: &Arc<FakeHost>, dir: &Path) -> Supervisord<FakeHost> {
        Supervisord::new(
            Arc::clone(host),
            dir.to_path_buf(),
            PathBuf::from("/var/log"),
            PathBuf::from("/usr/sbin/firecracker"),
        )
    }

    #[test]
    fn program_config_matches_supervisord_layout() {
        let host = Arc::new(FakeHost::default());
        let s = supervisord(&host, Path::new("/etc/supervisor/conf.d"));
        let conf = s.program_config(&name("t1"), Path::new("/var/run/firecracker/t1.sock"));
        assert_eq!(
            conf,
            "[program:t1]\n\
             command=/usr/sbin/firecracker --id t1 --api-sock /var/run/firecracker/t1.sock\n\
             stdout_logfile=/var/log/t1.log\n\
             stderr_logfile=/var/log/t1.error.log\n\
             autostart=true\n"
        );
        assert_eq!(s.conf_path(&name("t1")), PathBuf::from("/etc/supervisor/conf.d/t1.conf"));
    }

    #[tokio::test]
    async fn ensure_registered_writes_once_and_reloads() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let host = Arc::new(FakeHost::default());
        let s = supervisord(&host, dir.path());
        let vm = name("t1");
        let socket = Path::new("/run/t1.sock");

        assert!(matches!(s.ensure_registered(&vm, socket).await, Ok(true)));
        assert!(matches!(s.ensure_registered(&vm, socket).await, Ok(false)));
        assert!(dir.path().join("t1.conf").exists());
        assert_eq!(host.count("supervisorctl update"), 1, "reload only after a write");

        assert!(matches!(s.unregister(&vm).await, Ok(true)));
        assert!(matches!(s.unregister(&vm).await, Ok(false)));
        assert!(!dir.path().join("t1.conf").exists());
        assert_eq!(host.count("supervisorctl update"), 2);
    }

    #[tokio::test]
    async fn stopping_a_stopped_program_succeeds() {
        let host = Arc::new(FakeHost::default());
        host.script("supervisorctl stop t1", CommandOutput::failed(1, "t1: ERROR (not running)\n"));
        let s = supervisord(&host, Path::new("/nonexistent"));
        if let Err(e) = s.stop(&name("t1")).await {
            panic!("not running must count as stopped: {e}");
        }
    }

    #[tokio::test]
    async fn stopping_an_unknown_program_succeeds_but_starting_fails() {
        let host = Arc::new(FakeHost::default());
        host.script("supervisorctl stop t9", CommandOutput::failed(1, "t9: ERROR (no such process)\n"));
        host.script("supervisorctl start t9", CommandOutput::failed(1, "t9: ERROR (no such process)\n"));
        let s = supervisord(&host, Path::new("/nonexistent"));
        assert!(s.stop(&name("t9")).await.is_ok());
        assert!(s.start(&name("t9")).await.is_err());
    }

    #[tokio::test]
    async fn supervisorctl_failure_is_external_tool_error() {
        let host = Arc::new(FakeHost::default());
        host.script("supervisorctl start t1", CommandOutput::failed(7, "t1: ERROR (spawn error)\n"));
        let s = supervisord(&host, Path::new("/nonexistent"));
        let err = match s.start(&name("t1")).await {
            Ok(()) => panic!("spawn error must fail"),
            Err(e) => e,
        };
        assert!(matches!(err, ExecutorError::ExternalTool { ref tool, .. } if tool == "supervisorctl"));
        assert!(err.to_string().contains("spawn error"));
    }

    #[tokio::test]
    async fn supervisorctl_is_privileged() {
        let host = Arc::new(FakeHost::default());
        let s = supervisord(&host, Path::new("/nonexistent"));
        if let Err(e) = s.start(&name("t1")).await {
            panic!("start must succeed: {e}");
        }
        assert!(host.invocations().iter().all(|i| i.privileged));
    }
}
