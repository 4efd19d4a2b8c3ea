//! External command execution.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use archci_core::{ArchCiError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::step::CommandLine;

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code, `-1` when killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the external commands of build steps.
///
/// A non-zero exit is reported in [`CommandOutput`]; `Err` is reserved for
/// commands that could not be run at all (spawn failure, timeout).
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &CommandLine, cwd: Option<&Path>) -> Result<CommandOutput>;
}

/// Spawns real processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, command: &CommandLine, cwd: Option<&Path>) -> Result<CommandOutput> {
        debug!(command = %command, "spawning");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let child = cmd.spawn().map_err(|e| ArchCiError::StepFailed {
            step: command.program.clone(),
            reason: format!("failed to spawn: {e}"),
        })?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ArchCiError::StepFailed {
                    step: command.program.clone(),
                    reason: format!("timed out after {} seconds", limit.as_secs()),
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = ProcessExecutor::new()
            .run(&CommandLine::new("echo", ["hello"]), None)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let out = ProcessExecutor::new()
            .run(&CommandLine::new("sh", ["-c", "echo oops >&2; exit 3"]), None)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let out = ProcessExecutor::new()
            .run(&CommandLine::new("ls", Vec::<String>::new()), Some(dir.path()))
            .await
            .unwrap();
        assert!(out.stdout.contains("marker"));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = ProcessExecutor::new()
            .run(&CommandLine::new("archci-no-such-program", Vec::<String>::new()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchCiError::StepFailed { .. }));
    }

    #[tokio::test]
    async fn timeout_kills_long_commands() {
        let err = ProcessExecutor::with_timeout(Duration::from_millis(100))
            .run(&CommandLine::new("sleep", ["5"]), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
