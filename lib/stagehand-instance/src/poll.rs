//! Deadline-bounded retrying.
//!
//! Readiness probing and suspend/resume confirmation both retry at a fixed interval until an absolute deadline.
//! [`Deadline`] is the backoff policy for that: it is computed once by the caller, so time spent inside attempts counts
//! against it and it never drifts. Each delay it yields is the retry interval, clamped to whatever time remains, and it
//! stops yielding once the deadline has passed.

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use backon::{BackoffBuilder, BlockingRetryable as _};

/// Upper bound used when a timeout is too large to be represented as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// A fixed retry interval bounded by an absolute deadline.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Instant,
    interval: Duration,
}

impl Deadline {
    /// Creates a new `Deadline` that lies `timeout` from now, retrying every `interval`.
    pub fn after(timeout: Duration, interval: Duration) -> Self {
        let now = Instant::now();
        Self::at(now.checked_add(timeout).unwrap_or(now + FAR_FUTURE), interval)
    }

    /// Creates a new `Deadline` at the given instant, retrying every `interval`.
    pub fn at(at: Instant, interval: Duration) -> Self {
        Self { at, interval }
    }

    /// Returns the time left until the deadline, or zero if it has passed.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Returns `true` if the deadline has passed.
    pub fn has_passed(&self) -> bool {
        Instant::now() >= self.at
    }
}

impl BackoffBuilder for Deadline {
    type Backoff = DeadlineBackoff;

    fn build(self) -> Self::Backoff {
        DeadlineBackoff { deadline: self }
    }
}

/// Backoff produced by [`Deadline`].
#[derive(Clone, Copy, Debug)]
pub struct DeadlineBackoff {
    deadline: Deadline,
}

impl Iterator for DeadlineBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let remaining = self.deadline.remaining();
        if remaining.is_zero() {
            None
        } else {
            Some(self.deadline.interval.min(remaining))
        }
    }
}

/// Waits until `condition` returns `true`, checking every `interval`, for at most `timeout`.
///
/// Returns whether the condition was ever observed to hold. This is intended for test code that needs to wait for an
/// externally visible side effect of the supervised service.
pub fn wait_for<F>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    (|| if condition() { Ok(()) } else { Err(()) })
        .retry(Deadline::after(timeout, interval))
        .sleep(sleep)
        .call()
        .is_ok()
}
