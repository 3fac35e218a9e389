//! Control channel capability.
//!
//! The supervised service accepts newline-delimited JSON requests over its transport address: a request is a JSON array
//! whose first element is the command name (`["get-pid"]`), and the response is a single JSON object on its own line.
//! Responses carrying an `error` field are failures. The service may interleave unilateral notifications (objects with
//! `"unilateral": true`) before the response, and those are skipped.

use std::{
    fmt,
    io::{self, BufRead as _, BufReader, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use process_control::Pid;
use serde_json::{json, Value};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::trace;

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Shortest I/O timeout applied to a connection. Sockets reject a zero timeout.
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(1);

/// The endpoints a service instance listens on.
///
/// Which endpoint is actually used depends on the platform: the domain socket on Unix, and the named pipe on Windows.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TransportAddress {
    unix_socket: PathBuf,
    named_pipe: String,
}

impl TransportAddress {
    /// Creates a new `TransportAddress` from a domain socket path and a named pipe name.
    pub fn new<P, S>(unix_socket: P, named_pipe: S) -> Self
    where
        P: Into<PathBuf>,
        S: Into<String>,
    {
        Self {
            unix_socket: unix_socket.into(),
            named_pipe: named_pipe.into(),
        }
    }

    /// Returns the domain socket path.
    pub fn unix_socket(&self) -> &Path {
        &self.unix_socket
    }

    /// Returns the named pipe name.
    pub fn named_pipe(&self) -> &str {
        &self.named_pipe
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if cfg!(unix) {
            write!(f, "{}", self.unix_socket.display())
        } else {
            write!(f, "{}", self.named_pipe)
        }
    }
}

/// Control channel errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ControlError {
    /// Nothing is accepting connections at the address yet.
    #[snafu(display("Failed to connect to control channel at '{}': {}", address, source))]
    Connect {
        /// The address that was connected to.
        address: String,

        /// The underlying connection error.
        source: io::Error,
    },

    /// Reading or writing on an established connection failed.
    #[snafu(display("Control channel I/O failed: {}", source))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The request could not be serialized.
    #[snafu(display("Failed to encode control channel request: {}", source))]
    Encode {
        /// The underlying serialization error.
        source: serde_json::Error,
    },

    /// The response was not valid JSON.
    #[snafu(display("Failed to decode control channel response: {}", source))]
    Decode {
        /// The underlying deserialization error.
        source: serde_json::Error,
    },

    /// The connection was closed before a response arrived.
    #[snafu(display("Control channel closed before a response was received."))]
    Closed,

    /// The service answered with an error.
    #[snafu(display("Service rejected '{}': {}", command, message))]
    Service {
        /// Name of the command that was rejected.
        command: String,

        /// Error message returned by the service.
        message: String,
    },

    /// The response did not contain an expected field.
    #[snafu(display("Response to '{}' is missing field '{}'.", command, field))]
    MissingField {
        /// Name of the command that was sent.
        command: String,

        /// Name of the missing field.
        field: &'static str,
    },
}

impl ControlError {
    /// Returns `true` if this error means the service was not accepting connections.
    ///
    /// This is the only failure that is expected while a freshly spawned service is still starting up.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, ControlError::Connect { .. })
    }

    /// Returns `true` if this error means the service accepted the connection but did not answer in time.
    pub fn is_timeout(&self) -> bool {
        match self {
            ControlError::Io { source } => {
                matches!(source.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
            }
            _ => false,
        }
    }
}

/// A connect-and-query channel to a running service.
pub trait ControlChannel: Send + Sync {
    /// Sends `request` to the service at `address` and returns its response.
    ///
    /// # Errors
    ///
    /// If nothing is listening at `address`, [`ControlError::Connect`] is returned. Any other failure, including an
    /// error response from the service, is reported through the remaining variants.
    fn query(&self, address: &TransportAddress, request: &Value) -> Result<Value, ControlError>;

    /// Sends `request` to the service at `address`, waiting at most `timeout` for any single read or write.
    ///
    /// Channels that cannot bound their I/O fall back to [`query`][Self::query].
    ///
    /// # Errors
    ///
    /// Same as [`query`][Self::query]. A read or write that exceeds `timeout` is reported as an error for which
    /// [`ControlError::is_timeout`] holds.
    fn query_with_timeout(
        &self, address: &TransportAddress, request: &Value, _timeout: Duration,
    ) -> Result<Value, ControlError> {
        self.query(address, request)
    }

    /// Asks the service for its process identifier.
    ///
    /// # Errors
    ///
    /// If the query fails, or the response has no numeric `pid` field, an error is returned.
    fn get_pid(&self, address: &TransportAddress) -> Result<Pid, ControlError> {
        self.query(address, &json!(["get-pid"])).and_then(pid_from)
    }

    /// Asks the service for its process identifier, waiting at most `timeout` for any single read or write.
    ///
    /// # Errors
    ///
    /// If the query fails, or the response has no numeric `pid` field, an error is returned.
    fn get_pid_with_timeout(&self, address: &TransportAddress, timeout: Duration) -> Result<Pid, ControlError> {
        self.query_with_timeout(address, &json!(["get-pid"]), timeout)
            .and_then(pid_from)
    }
}

fn pid_from(response: Value) -> Result<Pid, ControlError> {
    response
        .get("pid")
        .and_then(Value::as_u64)
        .and_then(|pid| Pid::try_from(pid).ok())
        .context(MissingField {
            command: "get-pid",
            field: "pid",
        })
}

/// Line-delimited JSON control channel.
///
/// Opens a fresh connection per query.
#[derive(Clone, Debug)]
pub struct JsonControlChannel {
    io_timeout: Duration,
}

impl JsonControlChannel {
    /// Sets how long a single read or write on an established connection may block.
    ///
    /// Defaults to 30 seconds.
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    #[cfg(unix)]
    fn connect(
        &self, address: &TransportAddress, io_timeout: Duration,
    ) -> Result<std::os::unix::net::UnixStream, ControlError> {
        let stream = std::os::unix::net::UnixStream::connect(address.unix_socket()).context(Connect {
            address: address.unix_socket().display().to_string(),
        })?;
        stream.set_read_timeout(Some(io_timeout)).context(Io)?;
        stream.set_write_timeout(Some(io_timeout)).context(Io)?;
        Ok(stream)
    }

    #[cfg(not(unix))]
    fn connect(&self, address: &TransportAddress, _io_timeout: Duration) -> Result<std::fs::File, ControlError> {
        // Named pipes are opened like regular files. There is no portable way to apply I/O timeouts to them.
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(address.named_pipe())
            .context(Connect {
                address: address.named_pipe(),
            })
    }
}

impl Default for JsonControlChannel {
    fn default() -> Self {
        Self {
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

impl ControlChannel for JsonControlChannel {
    fn query(&self, address: &TransportAddress, request: &Value) -> Result<Value, ControlError> {
        let stream = self.connect(address, self.io_timeout)?;
        exchange(stream, request)
    }

    fn query_with_timeout(
        &self, address: &TransportAddress, request: &Value, timeout: Duration,
    ) -> Result<Value, ControlError> {
        let io_timeout = timeout.min(self.io_timeout).max(MIN_IO_TIMEOUT);
        let stream = self.connect(address, io_timeout)?;
        exchange(stream, request)
    }
}

fn command_name(request: &Value) -> String {
    request
        .get(0)
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
        .to_string()
}

fn exchange<S>(mut stream: S, request: &Value) -> Result<Value, ControlError>
where
    S: Read + Write,
{
    let mut payload = serde_json::to_vec(request).context(Encode)?;
    payload.push(b'\n');
    stream.write_all(&payload).context(Io)?;
    stream.flush().context(Io)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).context(Io)? == 0 {
            return Closed.fail();
        }

        let response: Value = serde_json::from_str(&line).context(Decode)?;
        if response.get("unilateral").and_then(Value::as_bool) == Some(true) {
            trace!(response = %line.trim_end(), "Skipping unilateral notification.");
            continue;
        }

        if let Some(message) = response.get("error") {
            let message = match message.as_str() {
                Some(message) => message.to_string(),
                None => message.to_string(),
            };
            return Service {
                command: command_name(request),
                message,
            }
            .fail();
        }

        return Ok(response);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        io::{BufRead as _, BufReader, Write as _},
        os::unix::net::UnixListener,
        thread::{self, JoinHandle},
    };

    use super::*;

    /// Accepts a single connection, reads one request line, and writes back the given lines verbatim.
    fn serve_once(socket: &Path, lines: Vec<&'static str>) -> JoinHandle<String> {
        let listener = UnixListener::bind(socket).expect("bind");
        thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut request = String::new();
            reader.read_line(&mut request).expect("read request");

            let mut writer = stream;
            for line in lines {
                writer.write_all(line.as_bytes()).expect("write");
                writer.write_all(b"\n").expect("write");
            }
            request
        })
    }

    fn address_in(dir: &Path) -> TransportAddress {
        TransportAddress::new(dir.join("sock"), "INVALID")
    }

    #[test]
    fn get_pid_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let address = address_in(dir.path());
        let server = serve_once(address.unix_socket(), vec![r#"{"version":"1.0","pid":4242}"#]);

        let pid = JsonControlChannel::default().get_pid(&address).unwrap();
        assert_eq!(pid, 4242);
        assert_eq!(server.join().unwrap().trim_end(), r#"["get-pid"]"#);
    }

    #[test]
    fn unilateral_notifications_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let address = address_in(dir.path());
        let server = serve_once(
            address.unix_socket(),
            vec![r#"{"unilateral":true,"log":"hello"}"#, r#"{"pid":77}"#],
        );

        assert_eq!(JsonControlChannel::default().get_pid(&address).unwrap(), 77);
        server.join().unwrap();
    }

    #[test]
    fn error_response() {
        let dir = tempfile::tempdir().unwrap();
        let address = address_in(dir.path());
        let server = serve_once(address.unix_socket(), vec![r#"{"error":"invalid log level"}"#]);

        let error = JsonControlChannel::default()
            .query(&address, &json!(["log-level", "invalid"]))
            .unwrap_err();
        match error {
            ControlError::Service { command, message } => {
                assert_eq!(command, "log-level");
                assert_eq!(message, "invalid log level");
            }
            other => panic!("unexpected error: {}", other),
        }
        server.join().unwrap();
    }

    #[test]
    fn missing_pid_field() {
        let dir = tempfile::tempdir().unwrap();
        let address = address_in(dir.path());
        let server = serve_once(address.unix_socket(), vec![r#"{"version":"1.0"}"#]);

        let error = JsonControlChannel::default().get_pid(&address).unwrap_err();
        assert!(matches!(error, ControlError::MissingField { field: "pid", .. }));
        assert!(!error.is_connect_failure());
        server.join().unwrap();
    }

    #[test]
    fn closed_without_response() {
        let dir = tempfile::tempdir().unwrap();
        let address = address_in(dir.path());
        let server = serve_once(address.unix_socket(), vec![]);

        let error = JsonControlChannel::default().get_pid(&address).unwrap_err();
        assert!(matches!(error, ControlError::Closed));
        server.join().unwrap();
    }

    #[test]
    fn silent_service_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let address = address_in(dir.path());
        let _listener = UnixListener::bind(address.unix_socket()).unwrap();

        let started = std::time::Instant::now();
        let error = JsonControlChannel::default()
            .get_pid_with_timeout(&address, Duration::from_millis(100))
            .unwrap_err();
        assert!(error.is_timeout(), "unexpected error: {}", error);
        assert!(!error.is_connect_failure());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn nothing_listening_is_a_connect_failure() {
        let dir = tempfile::tempdir().unwrap();
        let address = address_in(dir.path());

        let error = JsonControlChannel::default().get_pid(&address).unwrap_err();
        assert!(error.is_connect_failure());
        assert!(error.to_string().contains("sock"));
    }
}
