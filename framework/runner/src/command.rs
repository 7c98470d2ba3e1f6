//! Builds the command lines for every process the runner starts.
//!
//! Everything in here is pure: the same [RunPlan] and [ClusterConfig] always produce the same
//! command line, byte for byte.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;

use itertools::Itertools;
use swarm_core::prelude::{ClusterConfig, RunPlan, SwarmError, SwarmResult, LOOPBACK};

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Run `script` through `sh -c`, for pipelines and redirections.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// The same command wrapped in `nohup`, so it outlives the session that started it.
    pub fn detached(&self) -> Self {
        CommandLine::new("nohup")
            .arg(self.program.clone())
            .args(self.args.iter().cloned())
    }

    /// Render as a single line that a POSIX shell parses back into the same arguments.
    pub fn to_shell_string(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| shell_quote(part))
            .join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_string())
    }
}

/// Quote a word for a POSIX shell, leaving it untouched when that is safe.
pub fn shell_quote(word: &str) -> Cow<'_, str> {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,@%+".contains(c));
    if safe {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

/// How the workers on one remote driver are started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteWorkers {
    /// Number of worker processes to start on each driver.
    pub workers_per_driver: usize,
    /// Address the workers use to reach the master.
    pub master_host: String,
    /// Directory on the driver holding the workload.
    pub workdir: String,
    /// Whether the workload, params and config were copied into `workdir`.
    pub staged: bool,
}

/// The command lines the runner knows how to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRole {
    Standalone,
    Master { expected_workers: usize },
    Worker { master_host: String },
    RemoteWorkers(RemoteWorkers),
    KillWorkers,
}

pub struct CommandBuilder<'a> {
    plan: &'a RunPlan,
    config: &'a ClusterConfig,
    program: Option<String>,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(plan: &'a RunPlan, config: &'a ClusterConfig) -> Self {
        Self {
            plan,
            config,
            program: None,
        }
    }

    /// Use this path for the load generator instead of the configured binary name.
    pub fn with_program(mut self, program: impl AsRef<Path>) -> Self {
        self.program = Some(program.as_ref().display().to_string());
        self
    }

    /// Build the command for `role` and render it as one shell line.
    pub fn build(&self, role: &CommandRole) -> SwarmResult<String> {
        match role {
            CommandRole::Standalone => self.standalone().map(|c| c.to_shell_string()),
            CommandRole::Master { expected_workers } => {
                self.master(*expected_workers).map(|c| c.to_shell_string())
            }
            CommandRole::Worker { master_host } => {
                self.worker(master_host).map(|c| c.to_shell_string())
            }
            CommandRole::RemoteWorkers(workers) => self.remote_workers(workers),
            CommandRole::KillWorkers => self.kill_workers().map(|c| c.to_shell_string()),
        }
    }

    /// Master and a worker in one process.
    pub fn standalone(&self) -> SwarmResult<CommandLine> {
        let cmd = self
            .locust()
            .arg("--headless")
            .args(self.load_shape()?)
            .args(["--csv".to_string(), self.required_csv()?])
            .args(self.params())
            .args(["--loglevel", self.plan.log_level.as_str()])
            .args(self.config.extra_master_options());
        Ok(cmd)
    }

    pub fn master(&self, expected_workers: usize) -> SwarmResult<CommandLine> {
        let bind_host = self.config.master_bind_host()?;
        let bind_port = self.config.master_bind_port()?;

        let cmd = self
            .locust()
            .arg("--master")
            .arg("--headless")
            .args(self.load_shape()?)
            .args(["--master-bind-host", bind_host])
            .args(["--master-bind-port".to_string(), bind_port.to_string()])
            .args(["--expect-workers".to_string(), expected_workers.to_string()])
            .args(["--csv".to_string(), self.required_csv()?])
            .args(self.params())
            .args(["--loglevel", self.plan.log_level.as_str()])
            .args(self.config.extra_master_options());
        Ok(cmd)
    }

    /// A single worker process. `--worker --master-port <port>` stays adjacent, it is what
    /// [Self::kill_workers] matches on.
    pub fn worker(&self, master_host: &str) -> SwarmResult<CommandLine> {
        let port = self.config.master_bind_port()?;

        let cmd = self
            .locust()
            .arg("--worker")
            .args(["--master-port".to_string(), port.to_string()])
            .args(["--master-host", master_host])
            .args(self.params())
            .args(["--loglevel", self.plan.log_level.as_str()]);
        Ok(cmd)
    }

    /// Shell line run on a driver: change into the workload directory and start the workers there
    /// with this same tool, forced onto the local code path.
    pub fn remote_workers(&self, workers: &RemoteWorkers) -> SwarmResult<String> {
        let file = self.plan.workload_file_name()?;
        let (config_arg, params_arg) = if workers.staged {
            (
                file_name(&self.plan.config_path)?,
                self.plan
                    .params_path
                    .as_deref()
                    .map(|p| file_name(p).map(|name| format!("./{name}")))
                    .transpose()?,
            )
        } else {
            (
                self.plan.config_path.display().to_string(),
                self.plan
                    .params_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
            )
        };

        let mut invocation = CommandLine::new(self.config.remote_runner.as_str())
            .args(["--config".to_string(), config_arg])
            .args(["--log-level", self.plan.log_level.as_str()])
            .args(["--locustfile".to_string(), format!("./{file}")])
            .arg("--no-progress")
            .arg("run_workers")
            .args([
                "--num-workers".to_string(),
                workers.workers_per_driver.to_string(),
            ])
            .args(["--master-host", workers.master_host.as_str()])
            .args(["--drivers", LOOPBACK]);
        if let Some(params) = params_arg {
            invocation = invocation.args(["--params".to_string(), params]);
        }

        Ok(format!("cd {} && {}", shell_quote(&workers.workdir), invocation))
    }

    /// Kill every worker attached to the configured master port on a host.
    pub fn kill_workers(&self) -> SwarmResult<CommandLine> {
        let port = self.config.master_bind_port()?;

        // The bracket keeps the pattern from matching the shell running this command.
        Ok(CommandLine::new("pkill")
            .arg("-9")
            .arg("-f")
            .arg(format!("[w]orker --master-port {port}")))
    }

    fn locust(&self) -> CommandLine {
        let program = self
            .program
            .clone()
            .unwrap_or_else(|| self.config.locust_binary.clone());
        CommandLine::new(program).args([
            "--locustfile".to_string(),
            self.plan.workload_path.display().to_string(),
        ])
    }

    fn load_shape(&self) -> SwarmResult<Vec<String>> {
        let run_time = required(&self.plan.run_time, "run time")?;
        let users = required(&self.plan.user_count, "user count")?;
        let spawn_rate = required(&self.plan.spawn_rate, "spawn rate")?;

        Ok(vec![
            "--run-time".to_string(),
            run_time,
            "--users".to_string(),
            users.to_string(),
            "--spawn-rate".to_string(),
            spawn_rate.to_string(),
        ])
    }

    fn required_csv(&self) -> SwarmResult<String> {
        required(&self.plan.csv_prefix, "csv prefix")
    }

    fn params(&self) -> Vec<String> {
        self.plan
            .params_path
            .as_ref()
            .map(|p| vec!["--params".to_string(), p.display().to_string()])
            .unwrap_or_default()
    }
}

fn required<T: Clone>(value: &Option<T>, what: &str) -> SwarmResult<T> {
    value
        .clone()
        .ok_or_else(|| SwarmError::config(format!("The {what} is required for this command")))
}

fn file_name(path: &Path) -> SwarmResult<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| SwarmError::config(format!("'{}' has no file name", path.display())))
}
