use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use swarm_core::prelude::{SwarmError, SwarmResult};

use crate::transport::Transport;

/// Where the workload is staged on every driver.
pub const REMOTE_STAGING_DIR: &str = "/tmp/locust";

/// Copies the workload to the drivers so remote workers can run it.
#[derive(Clone)]
pub struct PayloadDistributor {
    transport: Arc<dyn Transport>,
    remote_dir: String,
}

impl PayloadDistributor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            remote_dir: REMOTE_STAGING_DIR.to_string(),
        }
    }

    /// Copy the contents of `local_dir`, and then each of `extra_files`, into the staging
    /// directory of every host.
    ///
    /// Hosts are served concurrently. Any failed copy fails the whole distribution, after every
    /// host has finished.
    pub async fn distribute(
        &self,
        hosts: &[String],
        local_dir: &Path,
        extra_files: &[PathBuf],
    ) -> SwarmResult<()> {
        if !local_dir.is_dir() {
            return Err(SwarmError::config(format!(
                "Workload directory {} does not exist",
                local_dir.display()
            )));
        }
        if let Some(missing) = extra_files.iter().find(|f| !f.is_file()) {
            return Err(SwarmError::config(format!(
                "File {} does not exist",
                missing.display()
            )));
        }

        log::info!(
            "Copying {} to {} on {} driver(s)",
            local_dir.display(),
            self.remote_dir,
            hosts.len()
        );
        let copies = hosts
            .iter()
            .map(|host| self.distribute_to(host, local_dir, extra_files));
        let results = join_all(copies).await;

        results.into_iter().collect::<SwarmResult<Vec<_>>>()?;
        Ok(())
    }

    async fn distribute_to(
        &self,
        host: &str,
        local_dir: &Path,
        extra_files: &[PathBuf],
    ) -> SwarmResult<()> {
        self.transport
            .copy(host, local_dir, &self.remote_dir)
            .await
            .inspect_err(|e| log::error!("Failed to copy workload to {host}: {e}"))?;

        for file in extra_files {
            self.transport
                .copy(host, file, &self.remote_dir)
                .await
                .inspect_err(|e| {
                    log::error!("Failed to copy {} to {host}: {e}", file.display())
                })?;
        }

        log::debug!("Workload staged on {host}");
        Ok(())
    }
}
