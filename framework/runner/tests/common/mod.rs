#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use swarm_core::prelude::{ClusterConfig, SwarmError, SwarmResult};
use swarm_runner::prelude::{CommandLine, HostOutput, Transport};
use tempfile::TempDir;

/// Records every remote call instead of making it.
#[derive(Default)]
pub struct MockTransport {
    execs: Mutex<Vec<(String, String)>>,
    copies: Mutex<Vec<(String, PathBuf, String)>>,
    /// `(host, command substring, exit code)`
    failures: Vec<(String, String, i32)>,
    unreachable: Vec<String>,
}

impl MockTransport {
    /// Make `command`s containing `needle` exit with `exit_code` on `host`.
    pub fn failing(mut self, host: &str, needle: &str, exit_code: i32) -> Self {
        self.failures
            .push((host.to_string(), needle.to_string(), exit_code));
        self
    }

    pub fn unreachable(mut self, host: &str) -> Self {
        self.unreachable.push(host.to_string());
        self
    }

    pub fn execs(&self) -> Vec<(String, String)> {
        self.execs.lock().clone()
    }

    /// Hosts that received a command containing `needle`, in the order the calls were made.
    pub fn hosts_running(&self, needle: &str) -> Vec<String> {
        self.execs
            .lock()
            .iter()
            .filter(|(_, command)| command.contains(needle))
            .map(|(host, _)| host.clone())
            .collect()
    }

    pub fn copies(&self) -> Vec<(String, PathBuf, String)> {
        self.copies.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.execs.lock().len() + self.copies.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn exec(&self, host: &str, command: &str) -> SwarmResult<HostOutput> {
        self.execs
            .lock()
            .push((host.to_string(), command.to_string()));

        if self.unreachable.iter().any(|h| h == host) {
            return Err(SwarmError::Transport {
                host: host.to_string(),
                message: "Connection timed out".to_string(),
            });
        }

        let exit_code = self
            .failures
            .iter()
            .find(|(h, needle, _)| h == host && command.contains(needle.as_str()))
            .map_or(0, |(_, _, code)| *code);
        Ok(HostOutput {
            exit_code,
            stdout: format!("ran on {host}\n"),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "scripted failure".to_string()
            },
        })
    }

    async fn copy(&self, host: &str, local: &Path, remote_dir: &str) -> SwarmResult<()> {
        self.copies
            .lock()
            .push((host.to_string(), local.to_path_buf(), remote_dir.to_string()));
        Ok(())
    }

    fn tunnel_command(&self, _host: &str, _port: u16) -> CommandLine {
        CommandLine::new("sleep").arg("30")
    }
}

/// Scratch space for one test: a workload, a config file and fake executables.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        std::fs::write(dir.path().join("locustfile.py"), "# workload\n")
            .expect("failed to write locustfile");
        std::fs::write(dir.path().join("params.yaml"), "users: 1\n")
            .expect("failed to write params");
        std::fs::write(dir.path().join("swarm_config.yaml"), "drivers: []\n")
            .expect("failed to write config");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn locustfile(&self) -> PathBuf {
        self.path().join("locustfile.py")
    }

    pub fn params(&self) -> PathBuf {
        self.path().join("params.yaml")
    }

    pub fn config_file(&self) -> PathBuf {
        self.path().join("swarm_config.yaml")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.path().join("out")
    }

    /// A stand-in for the load generator that prints its arguments and exits with `exit_code`.
    pub fn fake_locust(&self, exit_code: i32) -> PathBuf {
        self.fake_executable(
            &format!("locust-{exit_code}"),
            &format!("#!/bin/sh\necho \"locust $*\"\necho \"done\"\nexit {exit_code}\n"),
        )
    }

    /// A load generator that never finishes on its own.
    pub fn hanging_locust(&self) -> PathBuf {
        self.fake_executable("locust-hang", "#!/bin/sh\necho \"started\"\nexec sleep 30\n")
    }

    #[cfg(unix)]
    fn fake_executable(&self, name: &str, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt as _;

        let path = self.path().join(name);
        std::fs::write(&path, script).expect("failed to write fake executable");
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Config pointing at `locust`, with the master bound to `port`.
    pub fn config(&self, locust: &Path, port: u16) -> ClusterConfig {
        let mut config = ClusterConfig::default().with_master("127.0.0.1", port);
        config.locust_binary = locust.display().to_string();
        config
    }
}

/// Wait until `path` contains `needle`, for at most a few seconds.
pub async fn wait_for_content(path: &Path, needle: &str) -> bool {
    for _ in 0..50 {
        if let Ok(content) = std::fs::read_to_string(path) {
            if content.contains(needle) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}
