use std::{io, path::PathBuf, time::Duration};

use process_control::{Pid, ProcessControlError, SchedulingState};
use snafu::Snafu;

use crate::control::ControlError;

/// The lifecycle phase an [`InstanceError`] originated from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Creating the state directory or writing the service configuration.
    Provisioning,

    /// Launching the service process.
    Spawn,

    /// Waiting for the service to answer on its control channel.
    Readiness,

    /// Checking that an operation is allowed in the current lifecycle state.
    Precondition,

    /// Signalling the service process and confirming the resulting scheduling state.
    Confirmation,
}

/// Instance errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum InstanceError {
    /// The state directory or one of the files in it could not be created.
    #[snafu(display("Failed to provision instance state at '{}': {}", path.display(), source))]
    Provisioning {
        /// Path that could not be created.
        path: PathBuf,

        /// The underlying I/O error.
        source: io::Error,
    },

    /// The service configuration could not be serialized.
    #[snafu(display("Failed to encode service configuration: {}", source))]
    EncodeConfig {
        /// The underlying serialization error.
        source: serde_json::Error,
    },

    /// The service configuration could not be written.
    #[snafu(display("Failed to write service configuration to '{}': {}", path.display(), source))]
    WriteConfig {
        /// Path of the configuration file.
        path: PathBuf,

        /// The underlying I/O error.
        source: io::Error,
    },

    /// A service configuration file could not be read.
    #[snafu(display("Failed to read service configuration from '{}': {}", path.display(), source))]
    ReadConfig {
        /// Path of the configuration file.
        path: PathBuf,

        /// The underlying I/O error.
        source: io::Error,
    },

    /// A service configuration file did not contain a JSON object.
    #[snafu(display("Failed to decode service configuration from '{}': {}", path.display(), source))]
    DecodeConfig {
        /// Path of the configuration file.
        path: PathBuf,

        /// The underlying deserialization error.
        source: serde_json::Error,
    },

    /// A log file could not be read.
    #[snafu(display("Failed to read log file '{}': {}", path.display(), source))]
    ReadLog {
        /// Path of the log file.
        path: PathBuf,

        /// The underlying I/O error.
        source: io::Error,
    },

    /// The service binary could not be launched.
    #[snafu(display("Failed to spawn '{}': {}", binary.display(), source))]
    Spawn {
        /// The binary that was launched.
        binary: PathBuf,

        /// The underlying I/O error.
        source: io::Error,
    },

    /// `start` was called while a service process is already running.
    #[snafu(display("Instance already has a service process (child {}).", child_id))]
    AlreadyStarted {
        /// Operating system identifier of the existing child process.
        child_id: u32,
    },

    /// The service never accepted a connection before the start timeout elapsed.
    #[snafu(display(
        "Service did not become ready at '{}' within {:?} ({} attempt(s)): {}",
        address,
        timeout,
        attempts,
        source
    ))]
    ReadinessTimeout {
        /// The address that was probed.
        address: String,

        /// The start timeout.
        timeout: Duration,

        /// Number of probes made.
        attempts: usize,

        /// The failure from the final probe.
        source: ControlError,
    },

    /// The service accepted a connection but the readiness query failed.
    #[snafu(display("Readiness query to '{}' failed: {}", address, source))]
    ReadinessQuery {
        /// The address that was probed.
        address: String,

        /// The underlying control channel error.
        source: ControlError,
    },

    /// The operation requires a running, ready service process.
    #[snafu(display("Service process is not running: {}.", reason))]
    NotRunning {
        /// Why the service process is not considered running.
        reason: String,
    },

    /// The suspend or resume request could not be delivered.
    #[snafu(display("Failed to {} service process {}: {}", action, pid, source))]
    Signal {
        /// The requested transition.
        action: &'static str,

        /// Process identifier of the service.
        pid: Pid,

        /// The underlying process control error.
        source: ProcessControlError,
    },

    /// The scheduling state of the service process could not be observed.
    #[snafu(display("Failed to observe service process {}: {}", pid, source))]
    Observe {
        /// Process identifier of the service.
        pid: Pid,

        /// The underlying process control error.
        source: ProcessControlError,
    },

    /// The service process never reached the requested scheduling state.
    #[snafu(display(
        "Service process {} did not {} within {:?} (last observed state: {:?}).",
        pid,
        action,
        timeout,
        last_state
    ))]
    ConfirmationTimeout {
        /// The requested transition.
        action: &'static str,

        /// Process identifier of the service.
        pid: Pid,

        /// The confirmation timeout.
        timeout: Duration,

        /// The scheduling state observed by the final check.
        last_state: SchedulingState,
    },
}

impl InstanceError {
    /// Returns the lifecycle phase this error originated from.
    pub fn phase(&self) -> Phase {
        match self {
            InstanceError::Provisioning { .. }
            | InstanceError::EncodeConfig { .. }
            | InstanceError::WriteConfig { .. }
            | InstanceError::ReadConfig { .. }
            | InstanceError::DecodeConfig { .. }
            | InstanceError::ReadLog { .. } => Phase::Provisioning,
            InstanceError::Spawn { .. } => Phase::Spawn,
            InstanceError::ReadinessTimeout { .. } | InstanceError::ReadinessQuery { .. } => Phase::Readiness,
            InstanceError::AlreadyStarted { .. } | InstanceError::NotRunning { .. } => Phase::Precondition,
            InstanceError::Signal { .. }
            | InstanceError::Observe { .. }
            | InstanceError::ConfirmationTimeout { .. } => Phase::Confirmation,
        }
    }
}
