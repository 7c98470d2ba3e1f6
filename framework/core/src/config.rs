use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{SwarmError, SwarmResult};

/// Default name of the load generator executable.
pub const DEFAULT_LOCUST_BINARY: &str = "locust";

/// Default name of this tool on the remote drivers, used to start workers there.
pub const DEFAULT_REMOTE_RUNNER: &str = "swarm_runner";

/// Cluster configuration, loaded once from the swarm config file and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClusterConfig {
    /// Drivers to use when none are given on the command line.
    #[serde(default)]
    pub drivers: Vec<String>,

    #[serde(default, rename = "pssh_options")]
    pub transport_options: TransportOptions,

    #[serde(default, rename = "locust_master_options")]
    pub master_options: MasterOptions,

    /// Shell commands run in order on every driver by `configure`.
    #[serde(default, rename = "configure")]
    pub configure_commands: Vec<String>,

    /// Copy the workload directory to the drivers before starting remote workers.
    #[serde(default, rename = "distribute_locustfile_directory")]
    pub distribute_workload_directory: bool,

    /// Reach the master from remote workers through a reverse SSH tunnel.
    #[serde(default)]
    pub use_ssh_tunnel: bool,

    #[serde(default = "default_locust_binary")]
    pub locust_binary: String,

    #[serde(default = "default_remote_runner")]
    pub remote_runner: String,
}

/// Options for the remote shell transport.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TransportOptions {
    pub user: Option<String>,

    /// Private key used to authenticate with the drivers.
    pub pkey: Option<PathBuf>,

    /// Per-host connection timeout, in seconds.
    pub timeout: Option<u64>,

    #[serde(default = "default_num_retries")]
    pub num_retries: u32,

    pub port: Option<u16>,

    // Hosts are chosen per dispatch, so this is only here to be rejected.
    #[serde(default)]
    hosts: Option<serde_yaml::Value>,
}

/// Options for the Locust master process.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MasterOptions {
    #[serde(rename = "master-bind-host")]
    pub bind_host: Option<String>,

    #[serde(rename = "master-bind-port")]
    pub bind_port: Option<u16>,

    /// Extra flags appended verbatim to the master and standalone command lines.
    #[serde(default)]
    pub extra_options: Option<String>,
}

fn default_locust_binary() -> String {
    DEFAULT_LOCUST_BINARY.to_string()
}

fn default_remote_runner() -> String {
    DEFAULT_REMOTE_RUNNER.to_string()
}

fn default_num_retries() -> u32 {
    1
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            drivers: Vec::new(),
            transport_options: TransportOptions::default(),
            master_options: MasterOptions::default(),
            configure_commands: Vec::new(),
            distribute_workload_directory: false,
            use_ssh_tunnel: false,
            locust_binary: default_locust_binary(),
            remote_runner: default_remote_runner(),
        }
    }
}

impl ClusterConfig {
    /// Load and validate the config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> SwarmResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SwarmError::config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            SwarmError::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        log::debug!("Loaded config file {}", path.display());
        Self::from_yaml_str(&content).map_err(|e| match e {
            SwarmError::Config(msg) => SwarmError::config(format!(
                "Error occurred during parsing config file {}: {msg}",
                path.display()
            )),
            other => other,
        })
    }

    pub fn from_yaml_str(content: &str) -> SwarmResult<Self> {
        let config: ClusterConfig =
            serde_yaml::from_str(content).map_err(|e| SwarmError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> SwarmResult<()> {
        if self.transport_options.hosts.is_some() {
            return Err(SwarmError::config(
                "'pssh_options.hosts' must not be set, hosts come from the drivers list",
            ));
        }
        if self.locust_binary.trim().is_empty() {
            return Err(SwarmError::config("'locust_binary' must not be empty"));
        }
        Ok(())
    }

    pub fn master_bind_port(&self) -> SwarmResult<u16> {
        self.master_options.bind_port.ok_or_else(|| {
            SwarmError::config("'locust_master_options.master-bind-port' is not set")
        })
    }

    pub fn master_bind_host(&self) -> SwarmResult<&str> {
        self.master_options.bind_host.as_deref().ok_or_else(|| {
            SwarmError::config("'locust_master_options.master-bind-host' is not set")
        })
    }

    /// The extra master flags, split on whitespace.
    pub fn extra_master_options(&self) -> Vec<String> {
        self.master_options
            .extra_options
            .as_deref()
            .map(|extra| extra.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Set the master bind address. Mostly useful for building configs in code.
    pub fn with_master(mut self, bind_host: impl Into<String>, bind_port: u16) -> Self {
        self.master_options.bind_host = Some(bind_host.into());
        self.master_options.bind_port = Some(bind_port);
        self
    }
}
