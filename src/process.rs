//! Child process handle with on-demand liveness and bounded-grace shutdown

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Handle to one spawned server process and its log sink.
///
/// Liveness is polled from the OS on every query; nothing here caches a
/// running flag. The log file handle stays open for the lifetime of the
/// process and closes when the handle is dropped.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    _log: std::fs::File,
}

impl ProcessHandle {
    /// Spawn `binary` with `args`, working directory `dir`, and both stdout
    /// and stderr redirected into `log`. The child is placed in its own
    /// process group so manager shutdown does not implicitly signal it.
    pub fn spawn(
        binary: &Path,
        args: &[String],
        dir: &Path,
        log: std::fs::File,
    ) -> std::io::Result<Self> {
        let stdout = log.try_clone()?;
        let stderr = log.try_clone()?;

        let mut cmd = std::process::Command::new(binary);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = Command::from(cmd).spawn()?;
        Ok(Self { child, _log: log })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Fresh liveness poll. `Some(status)` means the process has exited.
    pub fn poll(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    pub fn is_alive(&mut self) -> bool {
        self.poll().is_none()
    }

    /// Graceful termination: SIGTERM, wait up to `grace`, then SIGKILL and
    /// wait unconditionally. Errors are logged, never returned.
    pub async fn shutdown(&mut self, grace: Duration) {
        if let Some(status) = self.poll() {
            info!(?status, "process already exited");
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                info!(pid, "sending SIGTERM");
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "process exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "error waiting for process exit");
            }
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "grace period exceeded, sending SIGKILL"
                );
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "failed to kill process");
                }
            }
        }
    }
}
