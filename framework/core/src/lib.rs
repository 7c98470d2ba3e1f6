mod config;
mod error;
mod plan;
mod shutdown;

pub mod prelude {
    pub use crate::config::{
        ClusterConfig, MasterOptions, TransportOptions, DEFAULT_LOCUST_BINARY,
        DEFAULT_REMOTE_RUNNER,
    };
    pub use crate::error::{OrchestrationError, SwarmError, SwarmResult};
    pub use crate::plan::{parse_timespan, Role, RunPlan, LOOPBACK};
    pub use crate::shutdown::{InterruptHandle, InterruptListener, InterruptedError};
}
