//! Drives one invocation of the runner from start to finish.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use derive_more::Display;
use swarm_core::prelude::{
    ClusterConfig, InterruptHandle, InterruptedError, OrchestrationError, Role, RunPlan,
    SwarmError, SwarmResult, LOOPBACK,
};

use crate::command::{CommandBuilder, CommandLine, RemoteWorkers};
use crate::distribute::{PayloadDistributor, REMOTE_STAGING_DIR};
use crate::fleet::{FleetCommand, FleetDispatcher};
use crate::locust_binary::locust_path;
use crate::monitor::warn_if_oversubscribed;
use crate::process::{LocalRunner, ManagedProcess, WaitMode};
use crate::progress::RunProgress;
use crate::transport::Transport;
use crate::tunnel::{close_tunnels, TunnelHandle, TunnelManager};

/// The phases a run goes through. Every phase entered is recorded, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RunState {
    #[display("idle")]
    Idle,
    #[display("provisioning drivers")]
    Provisioning,
    #[display("distributing the workload")]
    Distributing,
    #[display("opening tunnels")]
    Tunneling,
    #[display("spawning workers")]
    SpawningWorkers,
    #[display("running the master")]
    RunningMaster,
    #[display("cleaning up")]
    CleaningUp,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

/// How many workers each driver gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerAllocation {
    pub per_driver: usize,
    /// Workers left over by the integer division, not started anywhere.
    pub unassigned: usize,
}

impl WorkerAllocation {
    pub fn partition(total_workers: usize, driver_count: usize) -> SwarmResult<Self> {
        if driver_count == 0 {
            return Err(SwarmError::config("No drivers to run workers on"));
        }

        Ok(Self {
            per_driver: total_workers / driver_count,
            unassigned: total_workers % driver_count,
        })
    }
}

pub struct Coordinator {
    plan: RunPlan,
    config: ClusterConfig,
    dispatcher: FleetDispatcher,
    distributor: PayloadDistributor,
    tunnels: TunnelManager,
    runner: LocalRunner,
    interrupt: InterruptHandle,
    state: RunState,
    visited: Vec<RunState>,
    local_workers: Vec<ManagedProcess>,
    open_tunnels: Vec<TunnelHandle>,
}

impl Coordinator {
    pub fn new(
        plan: RunPlan,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        interrupt: InterruptHandle,
    ) -> Self {
        let runner = LocalRunner::default();
        Self {
            plan,
            config,
            dispatcher: FleetDispatcher::new(transport.clone()),
            distributor: PayloadDistributor::new(transport.clone()),
            tunnels: TunnelManager::new(transport, runner.clone()),
            runner,
            interrupt,
            state: RunState::Idle,
            visited: vec![RunState::Idle],
            local_workers: Vec::new(),
            open_tunnels: Vec::new(),
        }
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn visited_states(&self) -> &[RunState] {
        &self.visited
    }

    /// Workers started on this machine that are still tracked for cleanup.
    pub fn local_workers(&self) -> &[ManagedProcess] {
        &self.local_workers
    }

    /// Run the plan's role to completion.
    ///
    /// Any failure has already been logged when this returns, see
    /// [OrchestrationError::already_reported].
    pub async fn execute(&mut self) -> Result<(), OrchestrationError> {
        log::info!("Starting {}", self.plan.role);

        let result = match self.plan.role {
            Role::Configure => self.configure().await,
            Role::RunStandalone => self.run_standalone().await,
            Role::RunWorkers => self.run_workers().await,
            Role::RunMaster => {
                let result = self.run_master().await;
                self.finish_with_cleanup(result).await
            }
            Role::Run => {
                let result = match self.run_workers().await {
                    Ok(()) => self.run_master().await,
                    Err(e) => Err(e),
                };
                self.finish_with_cleanup(result).await
            }
        };

        match result {
            Ok(()) => {
                self.enter(RunState::Completed);
                log::info!("Finished {}", self.plan.role);
                Ok(())
            }
            Err((stage, e)) => {
                self.enter(RunState::Failed);
                Err(OrchestrationError::report(stage.to_string(), e))
            }
        }
    }

    async fn configure(&mut self) -> Result<(), (RunState, SwarmError)> {
        self.enter(RunState::Provisioning);
        self.configure_drivers().await.map_err(|e| (RunState::Provisioning, e))
    }

    async fn configure_drivers(&self) -> SwarmResult<()> {
        if self.plan.drivers.is_empty() {
            return Err(SwarmError::config("No drivers to configure"));
        }
        let remote = self.plan.remote_drivers();

        for command in &self.config.configure_commands {
            self.check_interrupt()?;
            log::info!("Configuring drivers: {command}");

            if self.plan.has_loopback() {
                self.interruptible(self.runner.run_shell(command)).await?;
            }
            if !remote.is_empty() {
                self.interruptible(self.dispatcher.run_on_hosts(
                    &remote,
                    &FleetCommand::Same(command.clone()),
                    true,
                ))
                .await?;
            }
        }

        Ok(())
    }

    async fn run_standalone(&mut self) -> Result<(), (RunState, SwarmError)> {
        self.enter(RunState::RunningMaster);
        self.run_master_process(|builder| builder.standalone())
            .await
            .map_err(|e| (RunState::RunningMaster, e))
    }

    async fn run_master(&mut self) -> Result<(), (RunState, SwarmError)> {
        self.enter(RunState::RunningMaster);
        let expected_workers = self.plan.total_workers;
        self.run_master_process(|builder| builder.master(expected_workers))
            .await
            .map_err(|e| (RunState::RunningMaster, e))
    }

    async fn run_master_process<F>(&self, build: F) -> SwarmResult<()>
    where
        F: FnOnce(&CommandBuilder<'_>) -> SwarmResult<CommandLine>,
    {
        self.check_interrupt()?;
        let program = locust_path(&self.config)?;
        let cmd = build(&CommandBuilder::new(&self.plan, &self.config).with_program(program))?;

        log::info!("Running: {cmd}");
        let mut process = self.runner.spawn(&cmd, WaitMode::Blocking)?;

        let mut progress = RunProgress::start(self.plan.planned_runtime(), !self.plan.no_progress);
        let result = stream_to_exit(&mut process, &self.interrupt, &progress).await;
        progress.finish();

        let exit_code = result?;
        if exit_code != 0 {
            return Err(SwarmError::Command {
                command: cmd.to_shell_string(),
                host: None,
                exit_code: Some(exit_code),
                stderr: "see the output above".to_string(),
            });
        }
        log::info!("Master exited cleanly");
        Ok(())
    }

    async fn run_workers(&mut self) -> Result<(), (RunState, SwarmError)> {
        if self.plan.drivers.is_empty() {
            return Err((
                RunState::SpawningWorkers,
                SwarmError::config("No drivers to run workers on"),
            ));
        }
        let allocation = WorkerAllocation::partition(self.plan.total_workers, self.plan.drivers.len())
            .map_err(|e| (RunState::SpawningWorkers, e))?;
        if allocation.unassigned > 0 {
            log::warn!(
                "{} workers don't divide evenly over {} drivers, {} will not be started",
                self.plan.total_workers,
                self.plan.drivers.len(),
                allocation.unassigned
            );
        }
        if allocation.per_driver == 0 {
            log::warn!("No workers to start on any driver");
        }

        let remote = self.plan.remote_drivers();
        if !remote.is_empty() {
            self.prepare_remote_drivers(&remote).await?;
        }

        self.enter(RunState::SpawningWorkers);
        if self.plan.has_loopback() {
            self.spawn_local_workers(allocation.per_driver)
                .map_err(|e| (RunState::SpawningWorkers, e))?;
        }
        if !remote.is_empty() {
            self.spawn_remote_workers(&remote, allocation.per_driver)
                .await
                .map_err(|e| (RunState::SpawningWorkers, e))?;
        }

        Ok(())
    }

    async fn prepare_remote_drivers(&mut self, remote: &[String]) -> Result<(), (RunState, SwarmError)> {
        if self.config.distribute_workload_directory {
            self.enter(RunState::Distributing);
            self.distribute(remote)
                .await
                .map_err(|e| (RunState::Distributing, e))?;
        }

        if self.config.use_ssh_tunnel {
            self.enter(RunState::Tunneling);
            let handles = self
                .start_tunnels(remote)
                .await
                .map_err(|e| (RunState::Tunneling, e))?;
            self.open_tunnels.extend(handles);
        }

        Ok(())
    }

    async fn distribute(&self, remote: &[String]) -> SwarmResult<()> {
        self.check_interrupt()?;
        let mut extra_files: Vec<PathBuf> = self.plan.params_path.iter().cloned().collect();
        extra_files.push(self.plan.config_path.clone());

        self.interruptible(self.distributor.distribute(
            remote,
            self.plan.workload_dir(),
            &extra_files,
        ))
        .await
    }

    async fn start_tunnels(&self, remote: &[String]) -> SwarmResult<Vec<TunnelHandle>> {
        self.check_interrupt()?;
        let port = self.config.master_bind_port()?;
        self.tunnels.open_tunnels(remote, port).await
    }

    fn spawn_local_workers(&mut self, count: usize) -> SwarmResult<()> {
        self.check_interrupt()?;
        if count == 0 {
            return Ok(());
        }
        warn_if_oversubscribed(count);

        let master_host = self.plan.master_host.as_deref().unwrap_or(LOOPBACK);
        let program = locust_path(&self.config)?;
        let cmd = CommandBuilder::new(&self.plan, &self.config)
            .with_program(program)
            .worker(master_host)?
            .detached();

        std::fs::create_dir_all(&self.plan.output_dir).map_err(|e| {
            SwarmError::launch(
                cmd.to_shell_string(),
                format!(
                    "Failed to create output directory {}: {e}",
                    self.plan.output_dir.display()
                ),
            )
        })?;

        log::info!("Starting {count} local workers: {cmd}");
        for i in 0..count {
            let log_path = self.plan.output_dir.join(format!("worker{i}.out"));
            let worker = self.runner.spawn_logged(&cmd, &log_path)?;
            log::debug!(
                "Worker {i} running as pid {:?}, output in {}",
                worker.pid(),
                log_path.display()
            );
            self.local_workers.push(worker);
        }

        Ok(())
    }

    async fn spawn_remote_workers(&self, remote: &[String], per_driver: usize) -> SwarmResult<()> {
        self.check_interrupt()?;
        let master_host = if self.config.use_ssh_tunnel {
            LOOPBACK.to_string()
        } else {
            self.plan.master_host.clone().ok_or_else(|| {
                SwarmError::config("A master host is required to start workers on remote drivers")
            })?
        };
        let staged = self.config.distribute_workload_directory;
        let workdir = if staged {
            REMOTE_STAGING_DIR.to_string()
        } else {
            self.plan.workload_dir().display().to_string()
        };

        let command = CommandBuilder::new(&self.plan, &self.config).remote_workers(&RemoteWorkers {
            workers_per_driver: per_driver,
            master_host,
            workdir,
            staged,
        })?;

        log::info!("Starting {per_driver} workers on each of {} drivers", remote.len());
        self.interruptible(
            self.dispatcher
                .run_on_hosts(remote, &FleetCommand::Same(command), true),
        )
        .await?;
        Ok(())
    }

    /// Run cleanup after a flow that may have left workers behind, keeping the flow's result.
    async fn finish_with_cleanup(
        &mut self,
        result: Result<(), (RunState, SwarmError)>,
    ) -> Result<(), (RunState, SwarmError)> {
        self.cleanup().await;
        result
    }

    /// Kill every worker this run may have started. Failures are logged and otherwise ignored.
    async fn cleanup(&mut self) {
        self.enter(RunState::CleaningUp);

        let tracked_workers = !self.local_workers.is_empty();
        for mut worker in self.local_workers.drain(..) {
            if let Err(e) = worker.kill().await {
                log::warn!("Failed to kill local worker: {e}");
            }
        }
        close_tunnels(std::mem::take(&mut self.open_tunnels)).await;

        if self.plan.drivers.is_empty() {
            return;
        }
        let kill = match CommandBuilder::new(&self.plan, &self.config).kill_workers() {
            Ok(kill) => kill,
            Err(e) => {
                log::warn!("Skipping worker cleanup: {e}");
                return;
            }
        };

        if self.plan.is_loopback_only() {
            if !tracked_workers {
                log::debug!("Killing local workers: {kill}");
                if let Err(e) = self.runner.run_shell(&kill.to_shell_string()).await {
                    log::debug!("No local workers killed: {e}");
                }
            }
            return;
        }

        let remote = self.plan.remote_drivers();
        log::info!("Killing workers on {} drivers", remote.len());
        if let Err(e) = self
            .dispatcher
            .run_on_hosts(&remote, &FleetCommand::Same(kill.to_shell_string()), false)
            .await
        {
            log::warn!("Failed to kill remote workers: {e}");
        }
    }

    fn enter(&mut self, state: RunState) {
        log::debug!("{} -> {}", self.state, state);
        self.state = state;
        self.visited.push(state);
    }

    fn check_interrupt(&self) -> SwarmResult<()> {
        if self.interrupt.is_interrupted() {
            return Err(InterruptedError::default().into());
        }
        Ok(())
    }

    /// Await `fut` unless the user interrupts first. Abandoned remote sessions are left to finish
    /// on their own.
    async fn interruptible<T>(&self, fut: impl Future<Output = SwarmResult<T>>) -> SwarmResult<T> {
        let mut listener = self.interrupt.subscribe();
        tokio::select! {
            result = fut => result,
            _ = listener.wait() => Err(InterruptedError::default().into()),
        }
    }
}

enum StreamEvent {
    Line(Option<String>),
    Interrupted,
}

/// Forward the process output line by line until it exits, killing it on interrupt.
async fn stream_to_exit(
    process: &mut ManagedProcess,
    interrupt: &InterruptHandle,
    progress: &RunProgress,
) -> SwarmResult<i32> {
    let mut listener = interrupt.subscribe();
    loop {
        let event = tokio::select! {
            line = process.next_line() => StreamEvent::Line(line?),
            _ = listener.wait() => StreamEvent::Interrupted,
        };

        match event {
            StreamEvent::Line(Some(line)) => progress.println(&line),
            StreamEvent::Line(None) => break,
            StreamEvent::Interrupted => {
                log::warn!("Interrupted, killing `{}`", process.command());
                if let Err(e) = process.kill().await {
                    log::warn!("{e}");
                }
                return Err(InterruptedError::default().into());
            }
        }
    }

    let exit_code = tokio::select! {
        code = process.wait() => Some(code?),
        _ = listener.wait() => None,
    };
    match exit_code {
        Some(code) => Ok(code),
        None => {
            if let Err(e) = process.kill().await {
                log::warn!("{e}");
            }
            Err(InterruptedError::default().into())
        }
    }
}
