use std::time::Duration;

use crate::shutdown::InterruptedError;

/// Result type used across the swarm runner crates.
pub type SwarmResult<T> = Result<T, SwarmError>;

/// The failures that can happen while orchestrating a run.
///
/// These are the low level errors produced by the individual components. The run coordinator
/// wraps whichever one ends a flow into an [OrchestrationError].
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    /// The config file is missing, can't be parsed or lacks a required option.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A process exited with a non-zero code or its executable could not be found.
    #[error("Command `{command}` failed{}: {stderr}", failure_detail(.host, .exit_code))]
    Command {
        command: String,
        host: Option<String>,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A local process did not finish within its allotted time and was killed.
    #[error("Command `{command}` timed out after {} seconds", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// The remote shell could not connect, authenticate or resolve the host.
    #[error("Transport error on host {host}: {message}")]
    Transport { host: String, message: String },

    #[error(transparent)]
    Interrupted(#[from] InterruptedError),
}

impl SwarmError {
    pub fn config(msg: impl Into<String>) -> Self {
        SwarmError::Config(msg.into())
    }

    /// A local command that could not be started, or whose process could not be observed.
    pub fn launch(command: impl Into<String>, reason: impl ToString) -> Self {
        SwarmError::Command {
            command: command.into(),
            host: None,
            exit_code: None,
            stderr: reason.to_string(),
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, SwarmError::Interrupted(_))
    }
}

fn failure_detail(host: &Option<String>, exit_code: &Option<i32>) -> String {
    let mut detail = String::new();
    if let Some(host) = host {
        detail.push_str(&format!(" on host {host}"));
    }
    match exit_code {
        Some(code) => detail.push_str(&format!(" with exit code {code}")),
        None => detail.push_str(" to start"),
    }
    detail
}

/// The single failure kind that leaves the run coordinator.
///
/// When `already_reported` is set the underlying error has been logged, with the command, host
/// and exit code, by the coordinator. Callers should then only report the exit code.
#[derive(Debug, thiserror::Error)]
#[error("Orchestration failed while {stage}: {source}")]
pub struct OrchestrationError {
    stage: String,
    #[source]
    source: SwarmError,
    already_reported: bool,
}

impl OrchestrationError {
    /// Log the error with its context and wrap it, flagged as reported.
    pub fn report(stage: impl Into<String>, source: SwarmError) -> Self {
        let stage = stage.into();
        if source.is_interrupt() {
            log::error!("Interrupted while {stage}, exiting now..");
        } else {
            log::error!("Failed while {stage}: {source}");
        }
        Self {
            stage,
            source,
            already_reported: true,
        }
    }

    /// Wrap the error without logging it.
    pub fn unreported(stage: impl Into<String>, source: SwarmError) -> Self {
        Self {
            stage: stage.into(),
            source,
            already_reported: false,
        }
    }

    pub fn already_reported(&self) -> bool {
        self.already_reported
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn cause(&self) -> &SwarmError {
        &self.source
    }

    pub fn is_interrupt(&self) -> bool {
        self.source.is_interrupt()
    }

    /// Process exit code for this failure: `2` for a user interrupt, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_interrupt() {
            2
        } else {
            1
        }
    }
}
