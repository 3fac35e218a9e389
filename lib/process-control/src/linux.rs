use std::fs;

use crate::{Introspect, Pid, ProcessControlError, SchedulingState};

pub(crate) fn scheduling_state(pid: Pid) -> Result<SchedulingState, ProcessControlError> {
    let stat_path = format!("/proc/{}/stat", pid);
    let contents = fs::read_to_string(&stat_path).map_err(|e| {
        Introspect {
            pid,
            reason: format!("failed to read {}: {}", stat_path, e),
        }
        .build()
    })?;

    parse_stat_state(&contents).ok_or_else(|| {
        Introspect {
            pid,
            reason: format!("malformed contents in {}", stat_path),
        }
        .build()
    })
}

/// Extracts the scheduling state from the contents of `/proc/<pid>/stat`.
///
/// The second field is the command name wrapped in parentheses, and it can contain both whitespace and parentheses
/// itself, so the state (third field) is located relative to the _last_ closing parenthesis.
fn parse_stat_state(stat: &str) -> Option<SchedulingState> {
    let command_end = stat.rfind(')')?;
    let state = stat.get(command_end + 1..)?.split_whitespace().next()?;

    // Only `T` (stopped by a job control signal) counts. `t` is a tracing stop, which SIGCONT does not undo.
    if state.contains('T') {
        Some(SchedulingState::Stopped)
    } else {
        Some(SchedulingState::Running)
    }
}
