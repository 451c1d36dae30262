//! Command execution boundary
//!
//! Every probe and remediation step reaches the host through [`CommandRunner`].
//! The trait keeps the health logic testable without real hardware: production
//! code uses [`ShellExecutor`], tests script responses with [`MockExecutor`].

mod mock;
mod shell;

pub use mock::{MockExecutor, MockResponse};
pub use shell::ShellExecutor;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised while running an external command
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command timed out after {timeout:?}: {command}")]
    Timeout { command: String, timeout: Duration },

    #[error("command exited with status {code}: {command}")]
    NonZeroExit {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("failed to spawn command {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    /// Captured stdout, if the command got far enough to produce any
    pub fn stdout(&self) -> Option<&str> {
        match self {
            ExecError::NonZeroExit { stdout, .. } => Some(stdout),
            _ => None,
        }
    }

    /// Captured stdout and stderr joined together
    pub fn output(&self) -> String {
        match self {
            ExecError::NonZeroExit { stdout, stderr, .. } => {
                format!("{}{}", stdout, stderr).trim().to_string()
            }
            _ => String::new(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }
}

/// Options controlling a single command invocation
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Abort the command after this long
    pub timeout: Option<Duration>,
    /// Prefix the command with sudo when not already running as root
    pub elevate: bool,
    /// Log the command instead of running it
    pub dry_run: bool,
    /// Extra environment variables for the child
    pub env: Vec<(String, String)>,
    /// Inherited environment variables starting with any of these prefixes are removed
    pub strip_env_prefixes: Vec<String>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn elevated(mut self) -> Self {
        self.elevate = true;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn strip_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_env_prefixes.push(prefix.into());
        self
    }
}

/// Captured result of a command that exited successfully
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Stdout split into lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

/// Runs shell commands on the local host
///
/// A command exiting non-zero is reported as [`ExecError::NonZeroExit`] with both
/// streams captured, so callers that care about failure output can still read it.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, opts: &ExecOptions) -> Result<CommandOutput, ExecError>;
}
