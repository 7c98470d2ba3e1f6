use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser as _;
use swarm_core::prelude::{ClusterConfig, OrchestrationError, SwarmError};
use swarm_runner::prelude::{start_interrupt_listener, Coordinator, SshTransport};

use crate::cli::{log_filter, SwarmCli};

mod cli;

const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code for failures nothing else accounts for.
const UNEXPECTED_FAILURE_EXIT_CODE: u8 = 127;

#[tokio::main]
async fn main() -> ExitCode {
    let args = SwarmCli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_filter(&args.log_level)),
    )
    .init();
    log::debug!("{CRATE_NAME} {CRATE_VERSION}");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(exit_code_for(&e)),
    }
}

async fn run(args: SwarmCli) -> anyhow::Result<()> {
    let config = ClusterConfig::load(&args.config)?;
    let plan = args.into_plan(&config)?;
    log::debug!("Running {} with drivers {:?}", plan.role, plan.drivers);

    let interrupt = start_interrupt_listener();
    let transport = Arc::new(SshTransport::new(config.transport_options.clone()));

    let mut coordinator = Coordinator::new(plan, config, transport, interrupt);
    coordinator
        .execute()
        .await
        .context("Orchestration failed")?;

    Ok(())
}

/// Map a failure to the process exit code, logging it unless that already happened.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(orchestration) = err.downcast_ref::<OrchestrationError>() {
        if !orchestration.already_reported() {
            log::error!("{orchestration}");
        }
        return orchestration.exit_code() as u8;
    }

    if let Some(swarm) = err.downcast_ref::<SwarmError>() {
        if swarm.is_interrupt() {
            log::error!("Interrupted, exiting now..");
            return 2;
        }
        log::error!("{swarm}");
        return 1;
    }

    log::error!("Unhandled error: {err:?}");
    UNEXPECTED_FAILURE_EXIT_CODE
}
