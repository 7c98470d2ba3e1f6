use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use swarm_core::prelude::{SwarmError, SwarmResult};

use crate::transport::{HostOutput, Transport};

/// The command sent to a fleet of hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCommand {
    /// The same command on every host.
    Same(String),
    /// One command per host, matched up by position.
    PerHost(Vec<String>),
}

impl FleetCommand {
    fn for_hosts(&self, hosts: &[String]) -> SwarmResult<Vec<String>> {
        match self {
            FleetCommand::Same(command) => Ok(vec![command.clone(); hosts.len()]),
            FleetCommand::PerHost(commands) => {
                if commands.len() != hosts.len() {
                    return Err(SwarmError::config(format!(
                        "Got {} commands for {} hosts",
                        commands.len(),
                        hosts.len()
                    )));
                }
                Ok(commands.clone())
            }
        }
    }
}

impl From<String> for FleetCommand {
    fn from(command: String) -> Self {
        FleetCommand::Same(command)
    }
}

impl From<&str> for FleetCommand {
    fn from(command: &str) -> Self {
        FleetCommand::Same(command.to_string())
    }
}

/// Per-host outcome of one dispatch, with an entry for every host that was targeted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetResult {
    outputs: BTreeMap<String, HostOutput>,
}

impl FleetResult {
    pub fn get(&self, host: &str) -> Option<&HostOutput> {
        self.outputs.get(host)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HostOutput)> {
        self.outputs.iter()
    }

    /// Hosts whose command did not exit cleanly, transport failures included.
    pub fn failures(&self) -> impl Iterator<Item = (&String, &HostOutput)> {
        self.outputs.iter().filter(|(_, output)| !output.success())
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Runs commands on many hosts at once through a [Transport].
#[derive(Clone)]
pub struct FleetDispatcher {
    transport: Arc<dyn Transport>,
}

impl FleetDispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Run `command` on every host concurrently and wait for all of them.
    ///
    /// Every session is joined before returning, so the result always covers every host. With
    /// `stop_on_first_error` any failure is turned into an error naming the first failed host, in
    /// host order.
    pub async fn run_on_hosts(
        &self,
        hosts: &[String],
        command: &FleetCommand,
        stop_on_first_error: bool,
    ) -> SwarmResult<FleetResult> {
        let commands = command.for_hosts(hosts)?;
        if hosts.is_empty() {
            return Ok(FleetResult::default());
        }

        let sessions = hosts.iter().zip(commands.iter()).map(|(host, command)| {
            let transport = self.transport.clone();
            async move {
                log::debug!(target: host.as_str(), "Running: {command}");
                let output = match transport.exec(host, command).await {
                    Ok(output) => output,
                    Err(e) => HostOutput::transport_failure(&e),
                };
                log_host_output(host, command, &output);
                output
            }
        });
        let outputs = join_all(sessions).await;

        let mut first_failure = None;
        let mut result = FleetResult::default();
        for ((host, command), output) in hosts.iter().zip(commands).zip(outputs) {
            if first_failure.is_none() && !output.success() {
                first_failure = Some(failure_error(host, &command, &output));
            }
            result.outputs.insert(host.clone(), output);
        }

        match first_failure {
            Some(err) if stop_on_first_error => Err(err),
            _ => Ok(result),
        }
    }
}

fn failure_error(host: &str, command: &str, output: &HostOutput) -> SwarmError {
    if output.is_transport_failure() {
        SwarmError::Transport {
            host: host.to_string(),
            message: output.stderr.trim().to_string(),
        }
    } else {
        SwarmError::Command {
            command: command.to_string(),
            host: Some(host.to_string()),
            exit_code: Some(output.exit_code),
            stderr: output.stderr.trim().to_string(),
        }
    }
}

fn log_host_output(host: &str, command: &str, output: &HostOutput) {
    for line in output.stdout.lines() {
        log::debug!(target: host, "{line}");
    }
    if output.success() {
        log::info!("[{host}] `{command}` succeeded");
    } else if output.is_transport_failure() {
        log::error!("[{host}] could not run `{command}`: {}", output.stderr.trim());
    } else {
        log::error!(
            "[{host}] `{command}` exited with code {}: {}",
            output.exit_code,
            output.stderr.trim()
        );
    }
}
