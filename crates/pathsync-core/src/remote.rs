//! Remote command execution.
//!
//! The matching engine only needs "run this argv on the remote host and give
//! me stdout plus the exit code". [`SshExecutor`] provides that over the
//! system `ssh` binary, reusing a multiplexed control connection when one is
//! available.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

use crate::config::RemoteConfig;

/// ssh reserves this exit status for its own failures.
const SSH_FAILURE_STATUS: i32 = 255;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("ssh executable not found: {0}")]
    MissingBinary(#[from] which::Error),
    #[error("Failed to spawn remote command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Connection to {destination} failed: {stderr}")]
    Connection { destination: String, stderr: String },
    #[error("Remote command terminated by signal")]
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub exit_code: i32,
}

impl RemoteOutput {
    /// Non-empty stdout lines with surrounding whitespace removed.
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

pub trait RemoteExecutor: Send + Sync {
    fn execute(&self, argv: &[String]) -> Result<RemoteOutput, RemoteError>;
}

impl<E: RemoteExecutor + ?Sized> RemoteExecutor for &E {
    fn execute(&self, argv: &[String]) -> Result<RemoteOutput, RemoteError> {
        (**self).execute(argv)
    }
}

#[derive(Debug, Clone)]
pub struct SshExecutor {
    remote: RemoteConfig,
}

impl SshExecutor {
    pub fn new(remote: RemoteConfig) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &RemoteConfig {
        &self.remote
    }

    /// Full ssh argument list (without the program) for `argv`.
    ///
    /// When persistence is enabled an existing control socket is reused;
    /// otherwise ssh is asked to create it on demand. If the master cannot be
    /// established ssh falls back to a plain connection for that call.
    pub fn compose(&self, argv: &[String]) -> Vec<String> {
        let mut args = Vec::new();
        if self.remote.persistent {
            let socket = self.remote.control_socket.to_string_lossy().to_string();
            if self.remote.control_socket.exists() {
                args.extend(["-S".to_string(), socket]);
            } else {
                args.extend([
                    "-o".to_string(),
                    "ControlMaster=auto".to_string(),
                    "-o".to_string(),
                    format!("ControlPath={socket}"),
                    "-o".to_string(),
                    "ControlPersist=20".to_string(),
                ]);
            }
        }
        args.extend(self.remote.ssh_options.iter().cloned());
        args.extend([
            "-p".to_string(),
            self.remote.port.to_string(),
            self.remote.destination(),
        ]);
        if !argv.is_empty() {
            // ssh hands the command to the remote shell as one string.
            args.push(shell_words::join(argv));
        }
        args
    }

    /// Remote host name. Also warms up the control connection.
    pub fn hostname(&self) -> Result<String, RemoteError> {
        let output = self.execute(&["hostname".to_string()])?;
        Ok(output.stdout.trim().to_string())
    }

    fn ssh_binary(&self) -> Result<PathBuf, RemoteError> {
        Ok(which::which("ssh")?)
    }
}

impl RemoteExecutor for SshExecutor {
    fn execute(&self, argv: &[String]) -> Result<RemoteOutput, RemoteError> {
        let ssh = self.ssh_binary()?;
        let args = self.compose(argv);
        debug!(destination = %self.remote.destination(), command = ?argv, "remote exec");
        let output = Command::new(ssh)
            .args(&args)
            .stdin(Stdio::null())
            .output()?;
        let exit_code = output.status.code().ok_or(RemoteError::Terminated)?;
        if exit_code == SSH_FAILURE_STATUS {
            return Err(RemoteError::Connection {
                destination: self.remote.destination(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(RemoteOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn remote(persistent: bool, socket: PathBuf) -> RemoteConfig {
        RemoteConfig {
            host: "vm.example".to_string(),
            username: "deploy".to_string(),
            port: 2222,
            persistent,
            control_socket: socket,
            ssh_options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
        }
    }

    #[test]
    fn compose_without_persistence() {
        let ssh = SshExecutor::new(remote(false, PathBuf::from("/unused")));
        let args = ssh.compose(&["find".to_string(), "/srv".to_string()]);
        assert_eq!(
            args,
            vec!["-o", "BatchMode=yes", "-p", "2222", "deploy@vm.example", "find /srv"]
        );
    }

    #[test]
    fn compose_requests_control_master_when_socket_is_missing() {
        let temp = tempfile::TempDir::new().expect("tempdir");
        let socket = temp.path().join("socket");
        let ssh = SshExecutor::new(remote(true, socket.clone()));
        let args = ssh.compose(&["hostname".to_string()]);
        assert!(args.contains(&"ControlMaster=auto".to_string()));
        assert!(args.contains(&format!("ControlPath={}", socket.display())));
        assert!(!args.contains(&"-S".to_string()));
    }

    #[test]
    fn compose_reuses_existing_socket() {
        let temp = tempfile::TempDir::new().expect("tempdir");
        let socket = temp.path().join("socket");
        std::fs::write(&socket, "").expect("fake socket");
        let ssh = SshExecutor::new(remote(true, socket.clone()));
        let args = ssh.compose(&["hostname".to_string()]);
        assert_eq!(args[0], "-S");
        assert_eq!(args[1], socket.to_string_lossy());
    }

    #[test]
    fn compose_quotes_unusual_names() {
        let ssh = SshExecutor::new(remote(false, PathBuf::from("/unused")));
        let args = ssh.compose(&[
            "find".to_string(),
            "/srv".to_string(),
            "-name".to_string(),
            "my file.conf".to_string(),
        ]);
        assert_eq!(args.last().map(String::as_str), Some("find /srv -name 'my file.conf'"));
    }

    #[test]
    fn output_lines_skip_blanks() {
        let output = RemoteOutput {
            stdout: "/srv/a/x.conf\n\n  /srv/b/x.conf  \n".to_string(),
            exit_code: 0,
        };
        assert_eq!(output.lines(), vec!["/srv/a/x.conf", "/srv/b/x.conf"]);
    }
}
