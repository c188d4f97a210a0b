//! SSH command session
//!
//! Drives the system `ssh` client as a subprocess, one invocation per
//! command. Password logins go through `sshpass -e` so the password never
//! appears on a command line; key-based logins run in batch mode.

use crate::session::{combined_output, run_with_timeout, CommandSession, SessionError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Exit status `ssh` uses for its own failures
const SSH_ERROR_STATUS: i32 = 255;

/// Exit status `sshpass` uses for a rejected password
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// Connection parameters for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    600
}

impl SshConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.host.trim().is_empty() {
            return Err(SessionError::InvalidConfig("host must not be empty".to_string()));
        }
        if self.host.chars().any(char::is_whitespace) {
            return Err(SessionError::InvalidConfig(format!(
                "host contains whitespace: {:?}",
                self.host
            )));
        }
        if self.username.trim().is_empty() {
            return Err(SessionError::InvalidConfig(format!(
                "username for {} must not be empty",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(SessionError::InvalidConfig(format!("port for {} must not be 0", self.host)));
        }
        if self.connect_timeout_secs == 0 || self.command_timeout_secs == 0 {
            return Err(SessionError::InvalidConfig(format!(
                "timeouts for {} must be greater than 0",
                self.host
            )));
        }
        Ok(())
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Session that runs every command through a fresh `ssh` invocation
pub struct SshSession {
    config: SshConfig,
}

impl SshSession {
    /// Validate the configuration and prove the host accepts our login
    ///
    /// Authentication failures, bad configuration and timeouts come back as
    /// distinct `SessionError` variants.
    pub async fn connect(config: SshConfig) -> Result<Self, SessionError> {
        config.validate()?;

        info!(host = %config.host, user = %config.username, "Opening SSH session");

        let session = Self { config };
        // Allow the handshake its own timeout plus a margin for the login check itself
        let limit = session.config.connect_timeout() + Duration::from_secs(5);
        let output = run_with_timeout(session.command("true"), "true", &session.config.host, limit).await?;

        if let Some(error) = session.classify_failure(&output) {
            return Err(error);
        }

        info!(host = %session.config.host, "SSH session established");
        Ok(session)
    }

    /// Build the full `ssh` command line for one remote command
    fn command(&self, remote: &str) -> Command {
        let config = &self.config;

        let mut cmd = match &config.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd.args(["-o", "PreferredAuthentications=password,keyboard-interactive"]);
                cmd.args(["-o", "PubkeyAuthentication=no"]);
                cmd
            }
            None => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };

        cmd.args(["-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", config.connect_timeout_secs))
            .arg("-p")
            .arg(config.port.to_string());

        if let Some(identity) = &config.identity_file {
            cmd.arg("-i").arg(identity);
        }

        cmd.arg(format!("{}@{}", config.username, config.host))
            .arg("--")
            .arg(remote);
        cmd
    }

    /// Map the client's own failure exits onto session errors
    fn classify_failure(&self, output: &std::process::Output) -> Option<SessionError> {
        let code = output.status.code()?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        let host = self.config.host.clone();

        if code == SSHPASS_BAD_PASSWORD && self.config.password.is_some() {
            return Some(SessionError::Authentication {
                host,
                user: self.config.username.clone(),
            });
        }
        if code != SSH_ERROR_STATUS {
            return None;
        }

        let reason = stderr.trim().to_string();
        let lowered = reason.to_lowercase();
        if lowered.contains("permission denied") || lowered.contains("authentication failed") {
            Some(SessionError::Authentication {
                host,
                user: self.config.username.clone(),
            })
        } else if lowered.contains("timed out") {
            Some(SessionError::Timeout {
                host,
                after: self.config.connect_timeout(),
            })
        } else if lowered.contains("bad configuration") || lowered.contains("bad port") {
            Some(SessionError::InvalidConfig(reason))
        } else {
            Some(SessionError::Unreachable { host, reason })
        }
    }
}

impl CommandSession for SshSession {
    fn host(&self) -> &str {
        &self.config.host
    }

    async fn send_command(&self, command: &str) -> Result<String, SessionError> {
        debug!(host = %self.config.host, command = command, "Sending command");
        let output = run_with_timeout(
            self.command(command),
            command,
            &self.config.host,
            self.config.command_timeout(),
        )
        .await?;

        // A lost connection shows up as the client's own failure status with nothing on stdout
        if output.stdout.is_empty() {
            if let Some(SessionError::Unreachable { host, reason }) = self.classify_failure(&output) {
                return Err(SessionError::Unreachable { host, reason });
            }
        }

        Ok(combined_output(&output))
    }

    async fn clear_buffer(&self) -> Result<(), SessionError> {
        // Each command runs on its own exec channel, nothing is left behind
        debug!(host = %self.config.host, "Clearing session buffer");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        info!(host = %self.config.host, "Closing SSH session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SshConfig {
        SshConfig {
            host: "plutopi1.local".to_string(),
            port: 22,
            username: "pi".to_string(),
            password: None,
            identity_file: None,
            connect_timeout_secs: 10,
            command_timeout_secs: 600,
        }
    }

    #[test]
    fn test_config_validation() {
        let mut config = config();
        assert!(config.validate().is_ok());

        config.host = String::new();
        assert!(matches!(config.validate(), Err(SessionError::InvalidConfig(_))));
        config.host = "plutopi1.local".to_string();

        config.username = " ".to_string();
        assert!(matches!(config.validate(), Err(SessionError::InvalidConfig(_))));
        config.username = "pi".to_string();

        config.connect_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(SessionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config_before_spawning() {
        let mut config = config();
        config.port = 0;
        let result = SshSession::connect(config).await;
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[test]
    fn test_command_line_without_password() {
        let session = SshSession { config: config() };
        let cmd = session.command("sudo wpanctl get NCP:State");
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "ssh");
        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"pi@plutopi1.local".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("sudo wpanctl get NCP:State"));
    }

    #[test]
    fn test_command_line_with_password_uses_sshpass() {
        let mut config = config();
        config.password = Some("secret".to_string());
        let session = SshSession { config };
        let cmd = session.command("true");
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "sshpass");
        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(!args.iter().any(|a| a.contains("secret")));
    }

    fn exited(code: i32, stderr: &str) -> std::process::Output {
        use std::os::unix::process::ExitStatusExt;
        std::process::Output {
            status: std::process::ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_classify_connection_failures() {
        let session = SshSession { config: config() };

        let denied = exited(255, "pi@plutopi1.local: Permission denied (publickey,password).");
        assert!(matches!(
            session.classify_failure(&denied),
            Some(SessionError::Authentication { ref user, .. }) if user == "pi"
        ));

        let timed_out = exited(255, "ssh: connect to host plutopi1.local port 22: Connection timed out");
        assert!(matches!(
            session.classify_failure(&timed_out),
            Some(SessionError::Timeout { after, .. }) if after == Duration::from_secs(10)
        ));

        let bad_config = exited(255, "command-line line 0: Bad configuration option: connecttimeot");
        assert!(matches!(
            session.classify_failure(&bad_config),
            Some(SessionError::InvalidConfig(_))
        ));

        let refused = exited(255, "ssh: connect to host plutopi1.local port 22: Connection refused");
        assert!(matches!(
            session.classify_failure(&refused),
            Some(SessionError::Unreachable { ref reason, .. }) if reason.contains("refused")
        ));
    }

    #[test]
    fn test_remote_exit_codes_are_not_failures() {
        let session = SshSession { config: config() };
        assert!(session.classify_failure(&exited(0, "")).is_none());
        assert!(session.classify_failure(&exited(1, "wpanctl: not found")).is_none());
        // 5 only means a bad password when sshpass is in use
        assert!(session.classify_failure(&exited(5, "")).is_none());
    }

    #[test]
    fn test_classify_sshpass_wrong_password() {
        let mut config = config();
        config.password = Some("wrong".to_string());
        let session = SshSession { config };

        assert!(matches!(
            session.classify_failure(&exited(5, "")),
            Some(SessionError::Authentication { .. })
        ));
    }
}
