use std::process::{Command, Stdio};

use crate::{Introspect, Pid, ProcessControlError, SchedulingState};

// Solaris-derived `ps` names the column `s`.
#[cfg(any(target_os = "solaris", target_os = "illumos"))]
const STATE_COLUMN: &str = "s";

#[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
const STATE_COLUMN: &str = "state";

pub(crate) fn scheduling_state(pid: Pid) -> Result<SchedulingState, ProcessControlError> {
    let output = Command::new("ps")
        .args(["-o", STATE_COLUMN, "-p", &pid.to_string()])
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            Introspect {
                pid,
                reason: format!("failed to run ps: {}", e),
            }
            .build()
        })?;

    parse_ps_output(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        Introspect {
            pid,
            reason: "process not listed by ps".to_string(),
        }
        .build()
    })
}

/// Extracts the scheduling state from the output of `ps -o state -p <pid>`.
///
/// The first line is always the column header, so output with fewer than two non-empty lines means the process was not
/// found.
fn parse_ps_output(output: &str) -> Option<SchedulingState> {
    let mut lines = output.lines().map(str::trim).filter(|line| !line.is_empty());
    let _header = lines.next()?;
    let status = lines.last()?;

    if status.contains('T') {
        Some(SchedulingState::Stopped)
    } else {
        Some(SchedulingState::Running)
    }
}
