use std::io;

use snafu::ResultExt as _;
use tracing::trace;

use crate::{Pid, ProcessControlError, ProcessController, SchedulingState, Signal};

/// Signal-based process controller.
///
/// Stops processes with `SIGSTOP` and continues them with `SIGCONT`. Neither signal can be caught or ignored by the
/// target, so a successful send is only ever undone by the opposite signal or by the process being killed.
#[derive(Clone, Debug, Default)]
pub struct SignalController;

impl ProcessController for SignalController {
    fn suspend(&self, pid: Pid) -> Result<(), ProcessControlError> {
        send_signal(pid, libc::SIGSTOP, "SIGSTOP")
    }

    fn resume(&self, pid: Pid) -> Result<(), ProcessControlError> {
        send_signal(pid, libc::SIGCONT, "SIGCONT")
    }

    fn scheduling_state(&self, pid: Pid) -> Result<SchedulingState, ProcessControlError> {
        #[cfg(target_os = "linux")]
        {
            crate::linux::scheduling_state(pid)
        }

        #[cfg(not(target_os = "linux"))]
        {
            crate::ps::scheduling_state(pid)
        }
    }
}

fn send_signal(pid: Pid, signal: libc::c_int, signal_name: &'static str) -> Result<(), ProcessControlError> {
    let raw_pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "process identifier out of range"))
        .context(Signal {
            pid,
            signal: signal_name,
        })?;

    trace!(pid, signal = signal_name, "Sending signal to process.");

    // SAFETY: `kill` has no memory safety preconditions. Invalid or stale identifiers are reported through `errno`.
    let result = unsafe { libc::kill(raw_pid, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error()).context(Signal {
            pid,
            signal: signal_name,
        })
    }
}
