use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::AccountError;

/// Non-interactive sudo; fails instead of prompting for a password.
pub const SUDO: [&str; 2] = ["sudo", "-n"];

/// Runs argv-only external commands (never through a shell), optionally
/// behind an escalation prefix such as [`SUDO`], each bounded by a timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    escalation: Vec<String>,
    timeout: Duration,
}

impl CommandRunner {
    pub const fn new(timeout: Duration) -> Self {
        Self {
            escalation: Vec::new(),
            timeout,
        }
    }

    /// Prefix every command except [`probe`](Self::probe) with `prefix`.
    pub fn escalated<S: Into<String>>(
        prefix: impl IntoIterator<Item = S>,
        timeout: Duration,
    ) -> Self {
        Self {
            escalation: prefix.into_iter().map(Into::into).collect(),
            timeout,
        }
    }

    /// Execute a command with logging. Logs the full command line at debug
    /// level and a human-friendly description at info level.
    pub async fn run(
        &self,
        description: &str,
        program: &str,
        args: &[&str],
    ) -> Result<(), AccountError> {
        self.run_with_stdin(description, program, args, None).await
    }

    /// Like [`run`](Self::run), streaming `input` to the child's stdin.
    pub async fn run_with_stdin(
        &self,
        description: &str,
        program: &str,
        args: &[&str],
        input: Option<&[u8]>,
    ) -> Result<(), AccountError> {
        tracing::info!("{description}");
        let (status, stderr, cmd_line) = self.exec(program, args, input).await?;

        if !status.success() {
            tracing::error!(command = %cmd_line, stderr = %stderr, "command failed");
            return Err(AccountError::CommandFailed {
                command: cmd_line,
                status: status.to_string(),
                stderr,
            });
        }
        Ok(())
    }

    /// Execute without privilege escalation and report only whether it
    /// exited successfully.
    pub async fn probe(&self, program: &str, args: &[&str]) -> Result<bool, AccountError> {
        Self::new(self.timeout).check(program, args).await
    }

    /// Execute with escalation and report only whether it exited
    /// successfully.
    pub async fn check(&self, program: &str, args: &[&str]) -> Result<bool, AccountError> {
        let (status, _, _) = self.exec(program, args, None).await?;
        Ok(status.success())
    }

    async fn exec(
        &self,
        program: &str,
        args: &[&str],
        input: Option<&[u8]>,
    ) -> Result<(std::process::ExitStatus, String, String), AccountError> {
        let mut argv: Vec<&str> = Vec::with_capacity(self.escalation.len() + args.len() + 1);
        argv.extend(self.escalation.iter().map(String::as_str));
        argv.push(program);
        argv.extend_from_slice(args);
        let cmd_line = argv.join(" ");
        tracing::debug!("exec: {cmd_line}");

        let mut child = Command::new(argv[0])
            .args(&argv[1..])
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AccountError::Spawn {
                command: cmd_line.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let run = async move {
            if let (Some(mut pipe), Some(bytes)) = (stdin, input) {
                pipe.write_all(bytes).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };

        // Dropping `run` on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| AccountError::Timeout {
                command: cmd_line.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| AccountError::Spawn {
                command: cmd_line.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok((output.status, stderr, cmd_line))
    }
}
