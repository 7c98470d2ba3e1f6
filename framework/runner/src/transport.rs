//! The remote shell used to reach the drivers.
//!
//! The runner does not speak SSH itself. [SshTransport] drives the system `ssh` and `scp`
//! clients, so keys, agents and `~/.ssh/config` all work the way they do for the user.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use swarm_core::prelude::{SwarmError, SwarmResult, TransportOptions};
use tokio::process::Command;

use crate::command::{shell_quote, CommandLine};
use crate::process::exit_code_of;

/// Exit code recorded for a host whose session could not be established.
pub const TRANSPORT_FAILURE_EXIT_CODE: i32 = -1;

/// `ssh` reports its own failures, as opposed to the remote command's, with this code.
const SSH_ERROR_EXIT_CODE: i32 = 255;

/// Default connection timeout when the config does not set one, in seconds.
const DEFAULT_CONNECT_TIMEOUT_S: u64 = 10;

/// What a command produced on one host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl HostOutput {
    /// Placeholder for a host the transport failed to reach.
    pub fn transport_failure(err: &SwarmError) -> Self {
        Self {
            exit_code: TRANSPORT_FAILURE_EXIT_CODE,
            stdout: String::new(),
            stderr: err.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn is_transport_failure(&self) -> bool {
        self.exit_code == TRANSPORT_FAILURE_EXIT_CODE
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a shell command on `host`.
    ///
    /// Returns [SwarmError::Transport] only when the session itself fails. A command that runs and
    /// exits non-zero is a successful call with a non-zero [HostOutput::exit_code].
    async fn exec(&self, host: &str, command: &str) -> SwarmResult<HostOutput>;

    /// Recursively copy `local` into the directory `remote_dir` on `host`, creating it if needed.
    async fn copy(&self, host: &str, local: &Path, remote_dir: &str) -> SwarmResult<()>;

    /// Local command that keeps a reverse tunnel open from `host:port` to `localhost:port`.
    fn tunnel_command(&self, host: &str, port: u16) -> CommandLine;
}

/// [Transport] over the system OpenSSH client.
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    options: TransportOptions,
}

impl SshTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.options.timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_S))
    }

    /// Options shared by `ssh` and `scp`.
    fn common_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout().as_secs()),
        ];
        if let Some(user) = &self.options.user {
            opts.push("-o".to_string());
            opts.push(format!("User={user}"));
        }
        if let Some(pkey) = &self.options.pkey {
            opts.push("-i".to_string());
            opts.push(pkey.display().to_string());
        }
        opts
    }

    fn ssh_args(&self) -> Vec<String> {
        let mut args = self.common_options();
        if let Some(port) = self.options.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args
    }

    fn scp_args(&self) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-r".to_string());
        if let Some(port) = self.options.port {
            args.push("-P".to_string());
            args.push(port.to_string());
        }
        args
    }

    /// Run one `ssh`/`scp` invocation, retrying when the client itself fails.
    async fn invoke(&self, host: &str, program: &str, args: &[String]) -> SwarmResult<HostOutput> {
        let attempts = self.options.num_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            log::trace!("{program} to {host}, attempt {attempt}/{attempts}");
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| SwarmError::Transport {
                    host: host.to_string(),
                    message: format!("Failed to run `{program}`: {e}"),
                })?;

            let exit_code = exit_code_of(output.status);
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if exit_code != SSH_ERROR_EXIT_CODE {
                return Ok(HostOutput {
                    exit_code,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr,
                });
            }

            log::debug!("{program} to {host} failed: {}", stderr.trim());
            last_error = stderr.trim().to_string();
            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        Err(SwarmError::Transport {
            host: host.to_string(),
            message: last_error,
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, host: &str, command: &str) -> SwarmResult<HostOutput> {
        let mut args = self.ssh_args();
        args.push(host.to_string());
        args.push(command.to_string());

        self.invoke(host, "ssh", &args).await
    }

    async fn copy(&self, host: &str, local: &Path, remote_dir: &str) -> SwarmResult<()> {
        let mkdir = self
            .exec(host, &format!("mkdir -p {}", shell_quote(remote_dir)))
            .await?;
        if !mkdir.success() {
            return Err(SwarmError::Transport {
                host: host.to_string(),
                message: format!(
                    "Failed to create {remote_dir}: {}",
                    mkdir.stderr.trim()
                ),
            });
        }

        let sources = copy_sources(local).map_err(|e| SwarmError::Transport {
            host: host.to_string(),
            message: format!("Failed to read {}: {e}", local.display()),
        })?;
        if sources.is_empty() {
            return Ok(());
        }

        let mut args = self.scp_args();
        args.extend(sources.iter().map(|p| p.display().to_string()));
        args.push(format!("{host}:{remote_dir}/"));

        let output = self.invoke(host, "scp", &args).await?;
        if !output.success() {
            return Err(SwarmError::Transport {
                host: host.to_string(),
                message: format!(
                    "Failed to copy {} to {remote_dir}: {}",
                    local.display(),
                    output.stderr.trim()
                ),
            });
        }
        Ok(())
    }

    fn tunnel_command(&self, host: &str, port: u16) -> CommandLine {
        CommandLine::new("ssh")
            .args(self.ssh_args())
            .args(["-o", "ExitOnForwardFailure=yes"])
            .arg("-N")
            .args(["-R".to_string(), format!("{port}:localhost:{port}")])
            .arg(host)
    }
}

/// A directory is copied by its entries, so they land directly in the remote directory.
fn copy_sources(local: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !local.is_dir() {
        return Ok(vec![local.to_path_buf()]);
    }

    let mut entries = std::fs::read_dir(local)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}
