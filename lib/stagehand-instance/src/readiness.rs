use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use backon::BlockingRetryable as _;
use process_control::Pid;
use snafu::ResultExt as _;
use tracing::{debug, trace};

use crate::{
    control::{ControlChannel, ControlError, TransportAddress},
    error::{InstanceError, ReadinessQuery, ReadinessTimeout},
    poll::Deadline,
};

/// Waits for a freshly spawned service to accept control channel connections.
///
/// The probe repeatedly asks the service for its process identifier. Connection failures are expected while the
/// service is starting up, as are queries that go unanswered because the service has bound its socket but is not
/// serving yet. Both are retried until the timeout elapses; any other failure ends probing immediately. Each query is
/// given at most the time remaining before the deadline, so probing ends close to the deadline even when the service
/// accepts connections without answering.
///
/// The probe does not check whether the service process is still alive, so a service that crashes on startup is
/// reported as a timeout whose source is the repeated connection failure.
#[derive(Clone, Copy, Debug)]
pub struct ReadinessProbe {
    timeout: Duration,
    interval: Duration,
}

impl ReadinessProbe {
    /// Creates a new `ReadinessProbe` that gives up after `timeout`, probing every `interval`.
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Probes `address` until the service reports its process identifier.
    ///
    /// # Errors
    ///
    /// If the service does not answer before the timeout elapses, `InstanceError::ReadinessTimeout` is returned with
    /// the final connection or timeout error as its source. If the service answers but the query fails,
    /// `InstanceError::ReadinessQuery` is returned.
    pub fn wait(&self, channel: &dyn ControlChannel, address: &TransportAddress) -> Result<Pid, InstanceError> {
        let started = Instant::now();
        let deadline = Deadline::after(self.timeout, self.interval);
        let mut attempts: usize = 1;

        let result = (|| channel.get_pid_with_timeout(address, deadline.remaining()))
            .retry(deadline)
            .when(still_starting)
            .notify(|e, delay| {
                attempts += 1;
                trace!(%address, error = %e, ?delay, "Service not answering yet.");
            })
            .sleep(sleep)
            .call();

        match result {
            Ok(pid) => {
                debug!(%address, pid, attempts, elapsed = ?started.elapsed(), "Service answered readiness probe.");
                Ok(pid)
            }
            Err(e) if still_starting(&e) => Err(e).context(ReadinessTimeout {
                address: address.to_string(),
                timeout: self.timeout,
                attempts,
            }),
            Err(e) => Err(e).context(ReadinessQuery {
                address: address.to_string(),
            }),
        }
    }
}

fn still_starting(error: &ControlError) -> bool {
    error.is_connect_failure() || error.is_timeout()
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{
            atomic::{AtomicUsize, Ordering::SeqCst},
            Mutex,
        },
    };

    use serde_json::{json, Value};

    use super::*;

    /// Control channel that replays scripted responses, repeating the last one once the script runs out.
    struct ScriptedChannel {
        script: Mutex<Vec<Result<Value, ControlError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedChannel {
        fn new(script: Vec<Result<Value, ControlError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(SeqCst)
        }
    }

    fn refused() -> Result<Value, ControlError> {
        Err(ControlError::Connect {
            address: "sock".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        })
    }

    impl ControlChannel for ScriptedChannel {
        fn query(&self, _address: &TransportAddress, request: &Value) -> Result<Value, ControlError> {
            assert_eq!(request, &json!(["get-pid"]));
            self.calls.fetch_add(1, SeqCst);

            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                match &script[0] {
                    Ok(value) => Ok(value.clone()),
                    Err(_) => refused(),
                }
            }
        }
    }

    fn address() -> TransportAddress {
        TransportAddress::new("/tmp/inst-test/sock", "INVALID")
    }

    #[test]
    fn ready_after_connection_failures() {
        let channel = ScriptedChannel::new(vec![refused(), refused(), Ok(json!({"pid": 321}))]);
        let probe = ReadinessProbe::new(Duration::from_secs(5), Duration::from_millis(1));

        assert_eq!(probe.wait(&channel, &address()).unwrap(), 321);
        assert_eq!(channel.calls(), 3);
    }

    #[test]
    fn timeout_preserves_connection_error() {
        let channel = ScriptedChannel::new(vec![refused()]);
        let probe = ReadinessProbe::new(Duration::from_millis(50), Duration::from_millis(5));

        let error = probe.wait(&channel, &address()).unwrap_err();
        assert_eq!(error.phase(), crate::Phase::Readiness);
        match error {
            InstanceError::ReadinessTimeout { source, attempts, .. } => {
                assert!(source.is_connect_failure());
                assert_eq!(attempts, channel.calls());
                assert!(attempts >= 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn query_failure_is_not_retried() {
        let channel = ScriptedChannel::new(vec![
            Err(ControlError::Service {
                command: "get-pid".to_string(),
                message: "unable to talk to your watchman".to_string(),
            }),
            Ok(json!({"pid": 5})),
        ]);
        let probe = ReadinessProbe::new(Duration::from_secs(5), Duration::from_millis(1));

        let error = probe.wait(&channel, &address()).unwrap_err();
        assert!(matches!(
            error,
            InstanceError::ReadinessQuery {
                source: ControlError::Service { .. },
                ..
            }
        ));
        assert_eq!(channel.calls(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn silent_listener_times_out_at_deadline() {
        use std::os::unix::net::UnixListener;

        use crate::control::JsonControlChannel;

        let dir = tempfile::tempdir().unwrap();
        let address = TransportAddress::new(dir.path().join("sock"), "INVALID");
        let _listener = UnixListener::bind(address.unix_socket()).unwrap();

        let channel = JsonControlChannel::default().with_io_timeout(Duration::from_secs(4));
        let timeout = Duration::from_millis(500);
        let probe = ReadinessProbe::new(timeout, Duration::from_millis(10));

        let started = Instant::now();
        let error = probe.wait(&channel, &address).unwrap_err();
        let elapsed = started.elapsed();

        assert!(elapsed >= timeout);
        assert!(elapsed < Duration::from_secs(2), "readiness wait overran its deadline: {:?}", elapsed);
        match error {
            InstanceError::ReadinessTimeout { source, .. } => assert!(source.is_timeout()),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn unanswered_query_is_retried() {
        let timed_out = || -> Result<Value, ControlError> {
            Err(ControlError::Io {
                source: io::Error::from(io::ErrorKind::WouldBlock),
            })
        };
        let channel = ScriptedChannel::new(vec![timed_out(), refused(), Ok(json!({"pid": 11}))]);
        let probe = ReadinessProbe::new(Duration::from_secs(5), Duration::from_millis(1));

        assert_eq!(probe.wait(&channel, &address()).unwrap(), 11);
        assert_eq!(channel.calls(), 3);
    }
}
