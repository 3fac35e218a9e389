use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use backon::BlockingRetryable as _;
use process_control::{Pid, ProcessControlError, ProcessController, SchedulingState};
use snafu::{IntoError as _, ResultExt as _};
use tracing::{debug, trace};

use crate::{
    error::{ConfirmationTimeout, InstanceError, Observe, Signal},
    poll::Deadline,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Transition {
    Suspend,
    Resume,
}

impl Transition {
    fn verb(self) -> &'static str {
        match self {
            Transition::Suspend => "suspend",
            Transition::Resume => "resume",
        }
    }

    fn wants_stopped(self) -> bool {
        self == Transition::Suspend
    }
}

enum Observation {
    Unsatisfied(SchedulingState),
    Failed(ProcessControlError),
}

/// Suspends and resumes a process, confirming that each transition took effect.
///
/// Both transitions happen in two phases: the request is delivered through the [`ProcessController`], and then the
/// scheduling state is polled until it reflects the transition or the confirmation timeout elapses. Preconditions on
/// the target process are the caller's responsibility.
pub struct SuspendController {
    controller: Box<dyn ProcessController>,
    timeout: Duration,
    interval: Duration,
}

impl SuspendController {
    /// Creates a new `SuspendController`.
    pub fn new(controller: Box<dyn ProcessController>, timeout: Duration, interval: Duration) -> Self {
        Self {
            controller,
            timeout,
            interval,
        }
    }

    /// Suspends `pid` and waits until it is observed as stopped.
    ///
    /// # Errors
    ///
    /// If the request cannot be delivered, the state cannot be observed, or the process is not observed as stopped
    /// within the confirmation timeout, an error is returned.
    pub fn suspend(&self, pid: Pid) -> Result<(), InstanceError> {
        self.transition(pid, Transition::Suspend)
    }

    /// Resumes `pid` and waits until it is no longer observed as stopped.
    ///
    /// # Errors
    ///
    /// If the request cannot be delivered, the state cannot be observed, or the process is still observed as stopped
    /// once the confirmation timeout elapses, an error is returned.
    pub fn resume(&self, pid: Pid) -> Result<(), InstanceError> {
        self.transition(pid, Transition::Resume)
    }

    fn transition(&self, pid: Pid, transition: Transition) -> Result<(), InstanceError> {
        let action = transition.verb();
        let started = Instant::now();

        match transition {
            Transition::Suspend => self.controller.suspend(pid),
            Transition::Resume => self.controller.resume(pid),
        }
        .context(Signal { action, pid })?;

        let want_stopped = transition.wants_stopped();
        let result = (|| match self.controller.scheduling_state(pid) {
            Ok(state) if state.satisfies(want_stopped) => Ok(state),
            Ok(state) => Err(Observation::Unsatisfied(state)),
            Err(e) => Err(Observation::Failed(e)),
        })
        .retry(Deadline::after(self.timeout, self.interval))
        .when(|observation| matches!(observation, Observation::Unsatisfied(_)))
        .notify(|observation, _| {
            if let Observation::Unsatisfied(state) = observation {
                trace!(pid, ?state, action, "Waiting for scheduling state to change.");
            }
        })
        .sleep(sleep)
        .call();

        match result {
            Ok(state) => {
                debug!(pid, ?state, action, elapsed = ?started.elapsed(), "Confirmed scheduling state transition.");
                Ok(())
            }
            Err(Observation::Unsatisfied(last_state)) => ConfirmationTimeout {
                action,
                pid,
                timeout: self.timeout,
                last_state,
            }
            .fail(),
            Err(Observation::Failed(e)) => Err(Observe { pid }.into_error(e)),
        }
    }
}
