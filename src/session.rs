//! Command sessions
//!
//! A session is the single channel through which a node is driven: send a
//! command string, get its textual output back. Implementations:
//! - `SshSession` (in `ssh.rs`) runs each command on a remote host through
//!   the system `ssh` client
//! - `LocalSession` runs commands on this host, used when the telemetry
//!   publisher runs on the node itself

use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors raised while opening or using a command session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication failed for {user}@{host}")]
    Authentication { host: String, user: String },

    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("timed out after {after:?} talking to {host}")]
    Timeout { host: String, after: Duration },

    #[error("{host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// One command channel to a node
///
/// Commands are issued strictly one after another; callers never hold two
/// in flight on the same session.
pub trait CommandSession {
    /// Host name or address the session talks to
    fn host(&self) -> &str;

    /// Run `command` and return its combined output with trailing newlines removed
    async fn send_command(&self, command: &str) -> Result<String, SessionError>;

    /// Discard any output still buffered on the channel
    async fn clear_buffer(&self) -> Result<(), SessionError>;

    /// Close the session
    async fn disconnect(&self) -> Result<(), SessionError>;
}

/// Runs commands through `sh -c` on the local host
pub struct LocalSession {
    host: String,
    command_timeout: Duration,
}

impl LocalSession {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            host: "localhost".to_string(),
            command_timeout,
        }
    }
}

impl CommandSession for LocalSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn send_command(&self, command: &str) -> Result<String, SessionError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        let output = run_with_timeout(cmd, command, &self.host, self.command_timeout).await?;
        Ok(combined_output(&output))
    }

    async fn clear_buffer(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Spawn `cmd`, wait for it to exit and collect its output, bounded by `limit`
pub(crate) async fn run_with_timeout(
    mut cmd: Command,
    command: &str,
    host: &str,
    limit: Duration,
) -> Result<Output, SessionError> {
    cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);

    let child = cmd.output();
    let output = tokio::time::timeout(limit, child)
        .await
        .map_err(|_| SessionError::Timeout {
            host: host.to_string(),
            after: limit,
        })?
        .map_err(|source| SessionError::Spawn {
            command: command.to_string(),
            source,
        })?;

    debug!(host = host, command = command, status = %output.status, "Command finished");
    Ok(output)
}

/// stdout followed by stderr, the way a terminal would show them
pub(crate) fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text.trim_end_matches(['\n', '\r']).to_string()
}
