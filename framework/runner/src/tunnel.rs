use std::sync::Arc;

use swarm_core::prelude::{SwarmError, SwarmResult};

use crate::process::{LocalRunner, ManagedProcess, WaitMode};
use crate::transport::Transport;

/// A reverse tunnel from a driver back to the master, kept open by a local process.
#[derive(Debug)]
pub struct TunnelHandle {
    host: String,
    process: ManagedProcess,
}

impl TunnelHandle {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn is_open(&mut self) -> bool {
        matches!(self.process.poll(), Ok(None))
    }

    pub async fn close(mut self) -> SwarmResult<()> {
        log::debug!("Closing tunnel to {}", self.host);
        self.process.kill().await
    }
}

/// Opens the reverse tunnels that let remote workers reach a master bound to loopback.
pub struct TunnelManager {
    transport: Arc<dyn Transport>,
    runner: LocalRunner,
}

impl TunnelManager {
    pub fn new(transport: Arc<dyn Transport>, runner: LocalRunner) -> Self {
        Self { transport, runner }
    }

    /// Forward `port` on every host to the same port here.
    ///
    /// The tunnels are left running on their own. If one can't be started the ones already
    /// opened are closed again.
    pub async fn open_tunnels(&self, hosts: &[String], port: u16) -> SwarmResult<Vec<TunnelHandle>> {
        let mut handles = Vec::with_capacity(hosts.len());
        for host in hosts {
            let cmd = self.transport.tunnel_command(host, port);
            log::info!("Opening tunnel to {host} for port {port}");
            match self.runner.spawn(&cmd, WaitMode::NonBlocking) {
                Ok(process) => {
                    log::debug!("Tunnel to {host} running as pid {:?}", process.pid());
                    handles.push(TunnelHandle {
                        host: host.clone(),
                        process,
                    })
                }
                Err(e) => {
                    close_tunnels(handles).await;
                    return Err(SwarmError::Transport {
                        host: host.clone(),
                        message: format!("Failed to open tunnel: {e}"),
                    });
                }
            }
        }

        Ok(handles)
    }
}

/// Close every tunnel, logging the ones that fail to go away.
pub async fn close_tunnels(handles: Vec<TunnelHandle>) {
    for handle in handles {
        let host = handle.host.clone();
        if let Err(e) = handle.close().await {
            log::warn!("Failed to close tunnel to {host}: {e}");
        }
    }
}
