//! Shell-backed command runner

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, trace};

use super::{CommandOutput, CommandRunner, ExecError, ExecOptions};

/// Runs commands through `sh -c`
pub struct ShellExecutor {
    user: Option<String>,
}

impl ShellExecutor {
    /// Create an executor for the user the process is running as
    pub fn new() -> Self {
        Self {
            user: std::env::var("USER").ok(),
        }
    }

    /// Create an executor that assumes the given user
    pub fn for_user(user: Option<String>) -> Self {
        Self { user }
    }

    fn needs_sudo(&self) -> bool {
        matches!(self.user.as_deref(), Some(user) if user != "root")
    }

    /// The command line that will actually be handed to the shell
    pub fn render(&self, command: &str, opts: &ExecOptions) -> String {
        if opts.elevate && self.needs_sudo() {
            format!("sudo {}", command)
        } else {
            command.to_string()
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ShellExecutor {
    async fn run(&self, command: &str, opts: &ExecOptions) -> Result<CommandOutput, ExecError> {
        let rendered = self.render(command, opts);

        if opts.dry_run {
            info!(command = %rendered, "[DRY-RUN] Would run command");
            return Ok(CommandOutput::default());
        }

        debug!(command = %rendered, "Running command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&rendered)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !opts.strip_env_prefixes.is_empty() {
            for (key, _) in std::env::vars() {
                if opts.strip_env_prefixes.iter().any(|p| key.starts_with(p)) {
                    cmd.env_remove(key);
                }
            }
        }
        cmd.envs(opts.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: rendered.clone(),
            source,
        })?;

        // The child is owned by the future, so a timeout drops and kills it.
        let wait = child.wait_with_output();
        let output = match opts.timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| ExecError::Timeout {
                    command: rendered.clone(),
                    timeout,
                })?,
            None => wait.await,
        }
        .map_err(|source| ExecError::Spawn {
            command: rendered.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);
        trace!(command = %rendered, exit_code, "Command finished");

        if exit_code != 0 {
            return Err(ExecError::NonZeroExit {
                command: rendered,
                code: exit_code,
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}
