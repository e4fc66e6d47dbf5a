//! Local shell executor.
//!
//! Runs a rendered script with `sh -c`, exporting the target name as
//! `RESHARD_TARGET`. The call is bounded by a transport budget; when the
//! budget runs out the call fails with `TransportTimeout` but the child is
//! left running, matching a remote transport that gives up on a script which
//! is still alive on its target.

use crate::collaborators::{ExecOutput, RemoteExecutor};
use crate::errors::RemoteError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

pub struct LocalShellExecutor {
    shell: String,
    transport_timeout: Duration,
}

impl LocalShellExecutor {
    pub fn new(transport_timeout: Duration) -> Self {
        Self {
            shell: "sh".to_string(),
            transport_timeout,
        }
    }

    /// Use a different shell binary (e.g. `bash`).
    pub fn with_shell(mut self, shell: &str) -> Self {
        self.shell = shell.to_string();
        self
    }
}

#[async_trait]
impl RemoteExecutor for LocalShellExecutor {
    async fn execute_remote(&self, target: &str, script: &str) -> Result<ExecOutput, RemoteError> {
        tracing::debug!(target_zone = target, shell = %self.shell, "executing script locally");

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .env("RESHARD_TARGET", target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| RemoteError::Failed {
                target: target.to_string(),
                source: anyhow::Error::new(e).context(format!("Failed to spawn {}", self.shell)),
            })?;

        match timeout(self.transport_timeout, child.wait_with_output()).await {
            Err(_) => Err(RemoteError::TransportTimeout {
                target: target.to_string(),
                budget: self.transport_timeout,
            }),
            Ok(Err(e)) => Err(RemoteError::Failed {
                target: target.to_string(),
                source: anyhow::Error::new(e).context("Failed to wait for script"),
            }),
            Ok(Ok(output)) => Ok(ExecOutput {
                exit_status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
        }
    }
}
