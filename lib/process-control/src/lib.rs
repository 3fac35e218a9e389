//! Process scheduling control.
//!
//! This crate provides a cross-platform way to pause and resume a process that we do not otherwise own, and to observe
//! whether the operating system currently considers that process stopped.
//!
//! ## Unix
//!
//! On Unix platforms, processes are paused with `SIGSTOP` and continued with `SIGCONT`. The scheduling state is read
//! from procfs (`/proc/<pid>/stat`) on Linux, and from the `state` column of `ps` everywhere else.
//!
//! ## Windows
//!
//! On Windows, an external helper program (`susres.exe` by default) is invoked to suspend or resume every thread of the
//! target process. There is no facility we can use to observe the result, so the scheduling state is always reported
//! as [`SchedulingState::Unobservable`].
#![deny(warnings)]
#![deny(missing_docs)]

use std::{io, path::PathBuf};

use snafu::Snafu;

mod helper;
pub use self::helper::HelperController;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use self::unix::SignalController;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(unix)]
#[cfg_attr(target_os = "linux", allow(dead_code))]
mod ps;

mod user;
pub use self::user::current_user_name;

/// A process identifier, as reported by the operating system.
pub type Pid = u32;

/// The controller used on the current platform.
#[cfg(unix)]
pub type PlatformController = SignalController;

/// The controller used on the current platform.
#[cfg(not(unix))]
pub type PlatformController = HelperController;

/// Creates the default controller for the current platform.
pub fn platform_controller() -> PlatformController {
    PlatformController::default()
}

/// Returns `true` if the given process identifier can never refer to a process we are allowed to control.
///
/// Identifier 0 addresses the whole process group on Unix, and identifier 1 is the init/supervisor process.
pub fn is_placeholder_pid(pid: Pid) -> bool {
    pid <= 1
}

/// Scheduling state of a process, as observed from outside of it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedulingState {
    /// The process is eligible to be scheduled.
    Running,

    /// The process has been stopped, and will not run until it is continued.
    Stopped,

    /// The platform offers no way to observe the scheduling state.
    Unobservable,
}

impl SchedulingState {
    /// Returns `true` if this state satisfies an expectation of the process being stopped (`want_stopped == true`) or
    /// not stopped (`want_stopped == false`).
    ///
    /// An unobservable state satisfies either expectation.
    pub fn satisfies(self, want_stopped: bool) -> bool {
        match self {
            SchedulingState::Running => !want_stopped,
            SchedulingState::Stopped => want_stopped,
            SchedulingState::Unobservable => true,
        }
    }
}

/// Process control errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ProcessControlError {
    /// A signal could not be delivered to the process.
    #[snafu(display("Failed to send {} to process {}: {}", signal, pid, source))]
    Signal {
        /// Target process.
        pid: Pid,

        /// Name of the signal.
        signal: &'static str,

        /// Error reported by the operating system.
        source: io::Error,
    },

    /// The suspend/resume helper program could not be run, or reported failure.
    #[snafu(display("Helper '{}' failed to {} process {}: {}", helper.display(), action, pid, reason))]
    Helper {
        /// Path to the helper program.
        helper: PathBuf,

        /// Action requested from the helper.
        action: &'static str,

        /// Target process.
        pid: Pid,

        /// Description of the failure.
        reason: String,
    },

    /// The scheduling state of the process could not be determined.
    #[snafu(display("Failed to inspect scheduling state of process {}: {}", pid, reason))]
    Introspect {
        /// Target process.
        pid: Pid,

        /// Description of the failure.
        reason: String,
    },
}

/// Pauses, continues, and observes processes.
///
/// Implementations only deliver the request and report what the operating system says. Confirming that a transition
/// actually took effect, and deciding how long to wait for it, is up to the caller.
pub trait ProcessController: Send + Sync {
    /// Asks the operating system to stop scheduling the given process.
    ///
    /// # Errors
    ///
    /// If the request could not be delivered, an error is returned.
    fn suspend(&self, pid: Pid) -> Result<(), ProcessControlError>;

    /// Asks the operating system to resume scheduling the given process.
    ///
    /// # Errors
    ///
    /// If the request could not be delivered, an error is returned.
    fn resume(&self, pid: Pid) -> Result<(), ProcessControlError>;

    /// Reports the current scheduling state of the given process.
    ///
    /// # Errors
    ///
    /// If the state cannot be read, for example because the process no longer exists, an error is returned.
    fn scheduling_state(&self, pid: Pid) -> Result<SchedulingState, ProcessControlError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_pids() {
        assert!(is_placeholder_pid(0));
        assert!(is_placeholder_pid(1));
        assert!(!is_placeholder_pid(2));
        assert!(!is_placeholder_pid(std::process::id()));
    }

    #[test]
    fn unobservable_satisfies_everything() {
        assert!(SchedulingState::Unobservable.satisfies(true));
        assert!(SchedulingState::Unobservable.satisfies(false));
        assert!(SchedulingState::Stopped.satisfies(true));
        assert!(!SchedulingState::Stopped.satisfies(false));
        assert!(SchedulingState::Running.satisfies(false));
        assert!(!SchedulingState::Running.satisfies(true));
    }
}
