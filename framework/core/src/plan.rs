use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SwarmError, SwarmResult};

/// The drivers entry meaning "run here, without the remote transport".
pub const LOOPBACK: &str = "127.0.0.1";

/// What a single invocation of the runner does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Run the configure commands on every driver.
    Configure,
    /// Start workers, locally or on the drivers, and return.
    RunWorkers,
    /// Run the master and stream its output until it exits.
    RunMaster,
    /// Run master and worker in a single local process.
    RunStandalone,
    /// Start the workers and then run the master.
    Run,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Configure => "configure",
            Role::RunWorkers => "run_workers",
            Role::RunMaster => "run_master",
            Role::RunStandalone => "run_standalone",
            Role::Run => "run",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything the user asked for in one invocation. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub role: Role,
    /// The locustfile, or workload directory, to run.
    pub workload_path: PathBuf,
    /// The config file this plan was built with, remote workers are pointed at it too.
    pub config_path: PathBuf,
    pub run_time: Option<String>,
    pub user_count: Option<u32>,
    pub spawn_rate: Option<u32>,
    pub csv_prefix: Option<String>,
    pub params_path: Option<PathBuf>,
    /// Workers the master should expect, or workers to spawn for the worker role.
    pub total_workers: usize,
    pub master_host: Option<String>,
    pub drivers: Vec<String>,
    pub log_level: String,
    /// Directory that receives the `worker<i>.out` files of local workers.
    pub output_dir: PathBuf,
    pub no_progress: bool,
}

impl RunPlan {
    pub fn new(
        role: Role,
        workload_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            role,
            workload_path: workload_path.into(),
            config_path: config_path.into(),
            run_time: None,
            user_count: None,
            spawn_rate: None,
            csv_prefix: None,
            params_path: None,
            total_workers: 0,
            master_host: None,
            drivers: Vec::new(),
            log_level: "INFO".to_string(),
            output_dir: PathBuf::from("."),
            no_progress: false,
        }
    }

    pub fn run_time(mut self, run_time: impl Into<String>) -> Self {
        self.run_time = Some(run_time.into());
        self
    }

    pub fn users(mut self, users: u32) -> Self {
        self.user_count = Some(users);
        self
    }

    pub fn spawn_rate(mut self, rate: u32) -> Self {
        self.spawn_rate = Some(rate);
        self
    }

    pub fn csv_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.csv_prefix = Some(prefix.into());
        self
    }

    pub fn params(mut self, path: impl Into<PathBuf>) -> Self {
        self.params_path = Some(path.into());
        self
    }

    pub fn workers(mut self, total: usize) -> Self {
        self.total_workers = total;
        self
    }

    pub fn master_host(mut self, host: impl Into<String>) -> Self {
        self.master_host = Some(host.into());
        self
    }

    pub fn drivers<I, S>(mut self, drivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.drivers = drivers.into_iter().map(Into::into).collect();
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn no_progress(mut self, no_progress: bool) -> Self {
        self.no_progress = no_progress;
        self
    }

    /// True when the drivers list is exactly the loopback sentinel.
    pub fn is_loopback_only(&self) -> bool {
        self.drivers.len() == 1 && self.drivers[0] == LOOPBACK
    }

    /// Drivers that need the remote transport, in order.
    pub fn remote_drivers(&self) -> Vec<String> {
        self.drivers
            .iter()
            .filter(|d| d.as_str() != LOOPBACK)
            .cloned()
            .collect()
    }

    pub fn has_loopback(&self) -> bool {
        self.drivers.iter().any(|d| d == LOOPBACK)
    }

    /// Directory holding the workload, copied to the drivers when distribution is enabled.
    pub fn workload_dir(&self) -> &Path {
        match self.workload_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// File name of the workload inside [Self::workload_dir].
    pub fn workload_file_name(&self) -> SwarmResult<String> {
        self.workload_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SwarmError::config(format!(
                    "Workload path '{}' has no file name",
                    self.workload_path.display()
                ))
            })
    }

    /// The planned run time, if one was given and it parses.
    pub fn planned_runtime(&self) -> Option<Duration> {
        self.run_time.as_deref().and_then(|t| parse_timespan(t).ok())
    }
}

/// Parse a Locust style time span: `20`, `20s`, `3m`, `2h`, `1h20m`, `3h30m10s`.
///
/// A bare number is a number of seconds.
pub fn parse_timespan(input: &str) -> SwarmResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SwarmError::config("Empty time span"));
    }
    if let Ok(seconds) = input.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let invalid = || {
        SwarmError::config(format!(
            "Invalid time span '{input}', expected e.g. 20, 20s, 3m, 2h, 1h20m, 3h30m10s"
        ))
    };

    let mut total = 0u64;
    let mut digits = String::new();
    let mut last_unit = 0u8;
    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let (rank, multiplier) = match c {
            'h' => (1, 3600),
            'm' => (2, 60),
            's' => (3, 1),
            _ => return Err(invalid()),
        };
        // Units must be given in h, m, s order and only once.
        if digits.is_empty() || rank <= last_unit {
            return Err(invalid());
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        total += value * multiplier;
        last_unit = rank;
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_seconds() {
        assert_eq!(parse_timespan("20").unwrap(), Duration::from_secs(20));
    }

    #[test]
    fn parse_single_units() {
        assert_eq!(parse_timespan("20s").unwrap(), Duration::from_secs(20));
        assert_eq!(parse_timespan("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_timespan("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn parse_combined_units() {
        assert_eq!(parse_timespan("1h20m").unwrap(), Duration::from_secs(4800));
        assert_eq!(
            parse_timespan("3h30m10s").unwrap(),
            Duration::from_secs(3 * 3600 + 30 * 60 + 10)
        );
    }

    #[test]
    fn reject_invalid_spans() {
        for span in ["", "m", "10x", "5m3h", "1h1h", "10m5"] {
            assert!(parse_timespan(span).is_err(), "'{span}' should not parse");
        }
    }

    #[test]
    fn loopback_only_detection() {
        let plan = RunPlan::new(Role::RunWorkers, "locustfile.py", "swarm_config.yaml");
        assert!(!plan.is_loopback_only());

        let plan = plan.drivers([LOOPBACK]);
        assert!(plan.is_loopback_only());
        assert!(plan.remote_drivers().is_empty());

        let plan = plan.drivers([LOOPBACK, "h1"]);
        assert!(!plan.is_loopback_only());
        assert!(plan.has_loopback());
        assert_eq!(plan.remote_drivers(), vec!["h1"]);
    }

    #[test]
    fn workload_dir_and_file() {
        let plan = RunPlan::new(Role::Run, "examples/locustfile_simple.py", "swarm_config.yaml");
        assert_eq!(plan.workload_dir(), Path::new("examples"));
        assert_eq!(plan.workload_file_name().unwrap(), "locustfile_simple.py");

        let plan = RunPlan::new(Role::Run, "locustfile.py", "swarm_config.yaml");
        assert_eq!(plan.workload_dir(), Path::new("."));
    }

    #[test]
    fn planned_runtime_ignores_bad_spans() {
        let plan = RunPlan::new(Role::RunMaster, "locustfile.py", "c.yaml").run_time("1m30s");
        assert_eq!(plan.planned_runtime(), Some(Duration::from_secs(90)));

        let plan = plan.run_time("soon");
        assert_eq!(plan.planned_runtime(), None);
    }
}
