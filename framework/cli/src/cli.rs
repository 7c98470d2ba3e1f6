use std::path::PathBuf;

use clap::{Parser, Subcommand};
use itertools::Itertools;
use swarm_core::prelude::{
    parse_timespan, ClusterConfig, Role, RunPlan, SwarmError, SwarmResult, LOOPBACK,
};

#[derive(Debug, Parser)]
#[command(
    name = "swarm_runner",
    about = "A tool for running Locust in a distributed fashion on a set of load generator servers",
    long_about = None
)]
pub struct SwarmCli {
    /// The swarm config file
    #[clap(long, alias = "swarm-config", default_value = "swarm_config.yaml", global = true)]
    pub config: PathBuf,

    /// Log level: DEBUG, INFO, WARNING or ERROR. `RUST_LOG` takes precedence when set.
    #[clap(long, default_value = "INFO", global = true)]
    pub log_level: String,

    /// The locustfile to run
    #[clap(short = 'f', long, global = true)]
    pub locustfile: Option<PathBuf>,

    /// Do not show a progress bar while the master runs.
    ///
    /// This is recommended for CI/CD environments where the progress bar isn't being looked at by
    /// anyone and is just adding noise to the logs.
    #[clap(long, default_value = "false", global = true)]
    pub no_progress: bool,

    #[command(subcommand)]
    pub command: SwarmCommand,
}

#[derive(Debug, Subcommand)]
#[command(rename_all = "snake_case")]
pub enum SwarmCommand {
    /// Run the configure commands on every driver
    Configure {
        /// Comma separated drivers, `127.0.0.1` runs locally. Defaults to the config's drivers.
        #[clap(long, value_delimiter = ',')]
        drivers: Option<Vec<String>>,
    },

    /// Start workers on the drivers and return without waiting for them
    RunWorkers {
        /// Number of worker processes, spread evenly over the drivers
        #[clap(long)]
        num_workers: usize,

        /// Address the workers use to reach the master
        #[clap(long)]
        master_host: String,

        #[clap(long)]
        params: Option<PathBuf>,

        /// Comma separated drivers, `127.0.0.1` runs locally. Defaults to the config's drivers,
        /// or to this machine when the config has none.
        #[clap(long, value_delimiter = ',')]
        drivers: Option<Vec<String>>,

        /// Directory for the `worker<i>.out` files of local workers
        #[clap(long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Run the master and wait for it to finish
    RunMaster {
        #[command(flatten)]
        load: LoadArgs,

        /// Number of workers the master waits for before starting the test
        #[clap(long)]
        expected_workers: usize,

        /// Drivers whose workers are killed once the master exits
        #[clap(long, value_delimiter = ',')]
        drivers: Option<Vec<String>>,
    },

    /// Run master and worker in one local process
    RunStandalone {
        #[command(flatten)]
        load: LoadArgs,
    },

    /// Start the workers, run the master and clean up the workers afterwards
    Run {
        #[command(flatten)]
        load: LoadArgs,

        #[clap(long)]
        num_workers: usize,

        #[clap(long, value_delimiter = ',')]
        drivers: Option<Vec<String>>,

        /// Address remote workers use to reach the master, not needed with `use_ssh_tunnel`
        #[clap(long)]
        master_host: Option<String>,

        #[clap(long, default_value = ".")]
        output_dir: PathBuf,
    },
}

/// The shape of the load, shared by every command that runs a master.
#[derive(Debug, clap::Args)]
pub struct LoadArgs {
    /// Run time, e.g. 20, 20s, 3m, 2h, 1h20m, 3h30m10s
    #[clap(long, value_parser = parse_run_time)]
    pub run_time: String,

    /// Number of concurrent users
    #[clap(short, long)]
    pub users: u32,

    /// Users started per second
    #[clap(short = 'r', long)]
    pub spawn_rate: u32,

    /// Prefix of the CSV result files
    #[clap(long)]
    pub csv: String,

    /// Parameters file passed through to the workload
    #[clap(long)]
    pub params: PathBuf,
}

fn parse_run_time(s: &str) -> anyhow::Result<String> {
    parse_timespan(s)?;
    Ok(s.to_string())
}

impl SwarmCommand {
    pub fn role(&self) -> Role {
        match self {
            SwarmCommand::Configure { .. } => Role::Configure,
            SwarmCommand::RunWorkers { .. } => Role::RunWorkers,
            SwarmCommand::RunMaster { .. } => Role::RunMaster,
            SwarmCommand::RunStandalone { .. } => Role::RunStandalone,
            SwarmCommand::Run { .. } => Role::Run,
        }
    }
}

impl SwarmCli {
    /// Turn the arguments into a plan, filling the drivers in from `config` when not given.
    pub fn into_plan(self, config: &ClusterConfig) -> SwarmResult<RunPlan> {
        let role = self.command.role();
        let locustfile = self.locustfile.ok_or_else(|| {
            SwarmError::config("A locustfile is required, pass it with -f/--locustfile")
        })?;

        let plan = RunPlan::new(role, locustfile, self.config)
            .log_level(self.log_level)
            .no_progress(self.no_progress);

        let plan = match self.command {
            SwarmCommand::Configure { drivers } => {
                plan.drivers(resolve_drivers(drivers, config, role))
            }
            SwarmCommand::RunWorkers {
                num_workers,
                master_host,
                params,
                drivers,
                output_dir,
            } => {
                let plan = plan
                    .workers(num_workers)
                    .master_host(master_host)
                    .drivers(resolve_drivers(drivers, config, role))
                    .output_dir(output_dir);
                match params {
                    Some(params) => plan.params(params),
                    None => plan,
                }
            }
            SwarmCommand::RunMaster {
                load,
                expected_workers,
                drivers,
            } => load
                .apply(plan)
                .workers(expected_workers)
                .drivers(resolve_drivers(drivers, config, role)),
            SwarmCommand::RunStandalone { load } => load.apply(plan),
            SwarmCommand::Run {
                load,
                num_workers,
                drivers,
                master_host,
                output_dir,
            } => {
                let plan = load
                    .apply(plan)
                    .workers(num_workers)
                    .drivers(resolve_drivers(drivers, config, role))
                    .output_dir(output_dir);
                match master_host {
                    Some(host) => plan.master_host(host),
                    None => plan,
                }
            }
        };

        Ok(plan)
    }
}

impl LoadArgs {
    fn apply(self, plan: RunPlan) -> RunPlan {
        plan.run_time(self.run_time)
            .users(self.users)
            .spawn_rate(self.spawn_rate)
            .csv_prefix(self.csv)
            .params(self.params)
    }
}

/// Drivers from the command line, else from the config. Only `run_workers` falls back to running
/// on this machine.
///
/// A driver listed twice is only used once, keeping the position of its first mention.
fn resolve_drivers(cli: Option<Vec<String>>, config: &ClusterConfig, role: Role) -> Vec<String> {
    let drivers = match cli {
        Some(drivers) if !drivers.is_empty() => drivers,
        _ if !config.drivers.is_empty() => config.drivers.clone(),
        _ if role == Role::RunWorkers => vec![LOOPBACK.to_string()],
        _ => Vec::new(),
    };

    let listed = drivers.len();
    let drivers = drivers.into_iter().unique().collect::<Vec<_>>();
    if drivers.len() < listed {
        log::warn!("Ignoring {} repeated driver(s), using {drivers:?}", listed - drivers.len());
    }
    drivers
}

/// Filter for `env_logger` matching a Locust style log level.
pub fn log_filter(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}
