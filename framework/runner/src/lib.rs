mod command;
mod coordinator;
mod distribute;
mod fleet;
mod locust_binary;
mod monitor;
mod process;
mod progress;
mod shutdown;
mod transport;
mod tunnel;

pub mod prelude {
    pub use crate::command::{shell_quote, CommandBuilder, CommandLine, CommandRole, RemoteWorkers};
    pub use crate::coordinator::{Coordinator, RunState, WorkerAllocation};
    pub use crate::distribute::{PayloadDistributor, REMOTE_STAGING_DIR};
    pub use crate::fleet::{FleetCommand, FleetDispatcher, FleetResult};
    pub use crate::locust_binary::{locust_path, SWARM_LOCUST_PATH_ENV};
    pub use crate::monitor::{cpu_count, warn_if_oversubscribed};
    pub use crate::process::{CommandOutput, LocalRunner, ManagedProcess, WaitMode, DEFAULT_TIMEOUT};
    pub use crate::shutdown::start_interrupt_listener;
    pub use crate::transport::{HostOutput, SshTransport, Transport, TRANSPORT_FAILURE_EXIT_CODE};
    pub use crate::tunnel::{close_tunnels, TunnelHandle, TunnelManager};
}
