use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use tracing::trace;

use crate::{Helper, Pid, ProcessControlError, ProcessController, SchedulingState};

const DEFAULT_HELPER: &str = "susres.exe";

/// Helper-program-based process controller.
///
/// Runs `<helper> suspend <pid>` and `<helper> resume <pid>`, treating a zero exit status as success. This is the
/// mechanism used on Windows, where there is no signal equivalent, but it works anywhere a suitable helper exists.
#[derive(Clone, Debug)]
pub struct HelperController {
    helper: PathBuf,
}

impl HelperController {
    /// Creates a new `HelperController` that runs the given helper program.
    pub fn with_helper<P: Into<PathBuf>>(helper: P) -> Self {
        Self { helper: helper.into() }
    }

    /// Returns the path to the helper program.
    pub fn helper(&self) -> &Path {
        &self.helper
    }

    fn invoke(&self, action: &'static str, pid: Pid) -> Result<(), ProcessControlError> {
        trace!(helper = %self.helper.display(), action, pid, "Invoking process control helper.");

        let status = Command::new(&self.helper)
            .arg(action)
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .status()
            .map_err(|e| {
                Helper {
                    helper: self.helper.clone(),
                    action,
                    pid,
                    reason: format!("failed to run: {}", e),
                }
                .build()
            })?;

        if status.success() {
            Ok(())
        } else {
            Helper {
                helper: self.helper.clone(),
                action,
                pid,
                reason: format!("exited with {}", status),
            }
            .fail()
        }
    }
}

impl Default for HelperController {
    fn default() -> Self {
        Self::with_helper(DEFAULT_HELPER)
    }
}

impl ProcessController for HelperController {
    fn suspend(&self, pid: Pid) -> Result<(), ProcessControlError> {
        self.invoke("suspend", pid)
    }

    fn resume(&self, pid: Pid) -> Result<(), ProcessControlError> {
        self.invoke("resume", pid)
    }

    fn scheduling_state(&self, _pid: Pid) -> Result<SchedulingState, ProcessControlError> {
        Ok(SchedulingState::Unobservable)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn successful_helper() {
        let controller = HelperController::with_helper("true");
        controller.suspend(42).expect("suspend");
        controller.resume(42).expect("resume");
        assert_eq!(controller.scheduling_state(42).unwrap(), SchedulingState::Unobservable);
    }

    #[test]
    fn failing_helper() {
        let controller = HelperController::with_helper("false");
        match controller.suspend(42).unwrap_err() {
            ProcessControlError::Helper { action, pid, .. } => {
                assert_eq!(action, "suspend");
                assert_eq!(pid, 42);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn missing_helper() {
        let controller = HelperController::with_helper("/nonexistent/susres.exe");
        assert!(matches!(
            controller.resume(42),
            Err(ProcessControlError::Helper { action: "resume", .. })
        ));
    }

    #[test]
    fn default_helper() {
        assert_eq!(HelperController::default().helper(), Path::new("susres.exe"));
    }
}
