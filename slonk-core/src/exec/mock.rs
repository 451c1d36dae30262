//! Scriptable command runner for testing

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{CommandOutput, CommandRunner, ExecError, ExecOptions};

/// A canned command result
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Command ran and exited with the given code
    Exit {
        stdout: String,
        stderr: String,
        code: i32,
    },
    /// Command hit its timeout
    Timeout,
}

impl MockResponse {
    /// Successful exit with the given stdout
    pub fn stdout(stdout: impl Into<String>) -> Self {
        MockResponse::Exit {
            stdout: stdout.into(),
            stderr: String::new(),
            code: 0,
        }
    }

    /// Failed exit with the given stdout and code
    pub fn fail(code: i32, stdout: impl Into<String>) -> Self {
        MockResponse::Exit {
            stdout: stdout.into(),
            stderr: String::new(),
            code,
        }
    }

    fn resolve(&self, command: &str, opts: &ExecOptions) -> Result<CommandOutput, ExecError> {
        match self {
            MockResponse::Exit {
                stdout,
                stderr,
                code: 0,
            } => Ok(CommandOutput {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
                exit_code: 0,
            }),
            MockResponse::Exit {
                stdout,
                stderr,
                code,
            } => Err(ExecError::NonZeroExit {
                command: command.to_string(),
                code: *code,
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            }),
            MockResponse::Timeout => Err(ExecError::Timeout {
                command: command.to_string(),
                timeout: opts.timeout.unwrap_or(Duration::ZERO),
            }),
        }
    }
}

struct Rule {
    pattern: String,
    responses: VecDeque<MockResponse>,
}

/// Mock runner matching commands by substring
///
/// The longest registered pattern contained in the command wins. A rule with
/// several responses hands them out in order and then keeps repeating the last
/// one. Commands without a rule fail to spawn.
#[derive(Default)]
pub struct MockExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to commands containing `pattern`
    pub fn on(&self, pattern: &str, response: MockResponse) -> &Self {
        self.on_sequence(pattern, vec![response])
    }

    /// Respond to successive matching commands with `responses` in order
    pub fn on_sequence(&self, pattern: &str, responses: Vec<MockResponse>) -> &Self {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        rules.retain(|r| r.pattern != pattern);
        rules.push(Rule {
            pattern: pattern.to_string(),
            responses: responses.into(),
        });
        self
    }

    /// Every command run so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of commands run that contained `pattern`
    pub fn call_count(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }
}

#[async_trait]
impl CommandRunner for MockExecutor {
    async fn run(&self, command: &str, opts: &ExecOptions) -> Result<CommandOutput, ExecError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(command.to_string());

        if opts.dry_run {
            return Ok(CommandOutput::default());
        }

        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let rule = rules
            .iter_mut()
            .filter(|r| command.contains(&r.pattern))
            .max_by_key(|r| r.pattern.len());

        match rule {
            Some(rule) => {
                let response = if rule.responses.len() > 1 {
                    rule.responses.pop_front()
                } else {
                    rule.responses.front().cloned()
                };
                match response {
                    Some(response) => response.resolve(command, opts),
                    None => Ok(CommandOutput::default()),
                }
            }
            None => Err(ExecError::Spawn {
                command: command.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no mock response registered",
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_longest_pattern_wins() {
        let exec = MockExecutor::new();
        exec.on("nvidia-smi", MockResponse::stdout("plain"));
        exec.on("nvidia-smi --query-gpu", MockResponse::stdout("query"));

        let opts = ExecOptions::new();
        let out = exec.run("nvidia-smi --query-gpu=uuid", &opts).await.unwrap();
        assert_eq!(out.stdout, "query");
        let out = exec.run("nvidia-smi", &opts).await.unwrap();
        assert_eq!(out.stdout, "plain");
    }

    #[tokio::test]
    async fn test_sequence_repeats_last() {
        let exec = MockExecutor::new();
        exec.on_sequence(
            "ping",
            vec![MockResponse::fail(1, ""), MockResponse::stdout("ok")],
        );

        let opts = ExecOptions::new();
        assert!(exec.run("ping -c 1 a", &opts).await.is_err());
        assert!(exec.run("ping -c 1 a", &opts).await.is_ok());
        assert!(exec.run("ping -c 1 a", &opts).await.is_ok());
        assert_eq!(exec.call_count("ping"), 3);
    }

    #[tokio::test]
    async fn test_unmatched_command_fails() {
        let exec = MockExecutor::new();
        let err = exec.run("lspci", &ExecOptions::new()).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
