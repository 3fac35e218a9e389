use std::{
    ffi::OsStr,
    fs::{self, File},
    io::{self, BufRead as _},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};

use process_control::{is_placeholder_pid, platform_controller, Pid, ProcessController};
use serde_json::Value;
use snafu::{OptionExt as _, ResultExt as _};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::{
    control::{ControlChannel, ControlError, JsonControlChannel, TransportAddress},
    error::{AlreadyStarted, InstanceError, NotRunning, Provisioning, ReadLog, Spawn},
    layout::InstanceLayout,
    options::InstanceOptions,
    readiness::ReadinessProbe,
    service_config::ServiceConfig,
    suspend::SuspendController,
};

/// Environment variable that stops the service CLI from spawning a server on its own.
const NO_SPAWN_ENV_VAR: &str = "WATCHMAN_NO_SPAWN";

struct RunningProcess {
    child: Child,
    pid: Option<Pid>,
    started_at: Instant,
}

/// Captured result of a one-shot CLI invocation.
#[derive(Clone, Debug)]
pub struct CommandOutput {
    /// Exit status of the invocation.
    pub status: ExitStatus,

    /// Everything written to standard output.
    pub stdout: Vec<u8>,

    /// Everything written to standard error.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Returns `true` if the invocation exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Returns standard output as a string, replacing invalid UTF-8.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Returns standard error as a string, replacing invalid UTF-8.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A single supervised service instance.
///
/// Constructing an `Instance` provisions its state directory and writes the service configuration. The service itself
/// is only launched by [`start`][Self::start], and is killed by [`stop`][Self::stop] or, at the latest, when the
/// `Instance` is dropped. The state directory outlives `stop` so that logs and configuration remain inspectable, and
/// is removed on drop unless [`InstanceOptions::retain_state`] is set.
pub struct Instance {
    options: InstanceOptions,
    layout: InstanceLayout,
    state_dir: Option<TempDir>,
    channel: Box<dyn ControlChannel>,
    suspender: SuspendController,
    running: Option<RunningProcess>,
}

impl Instance {
    /// Creates a new `Instance`, provisioning its state directory and writing `config` into it.
    ///
    /// # Errors
    ///
    /// If the state directory cannot be created, or the configuration cannot be written, an error is returned.
    pub fn new(options: InstanceOptions, config: &ServiceConfig) -> Result<Self, InstanceError> {
        let (state_dir, layout) = options.layout.provision(&options.temp_root())?;
        config.write_to(layout.config_path())?;

        debug!(
            base_dir = %layout.base_dir().display(),
            config_path = %layout.config_path().display(),
            "Wrote service configuration."
        );

        let suspender = SuspendController::new(
            Box::new(platform_controller()),
            options.confirmation_timeout,
            options.confirmation_interval,
        );

        Ok(Self {
            options,
            layout,
            state_dir: Some(state_dir),
            channel: Box::new(JsonControlChannel::default()),
            suspender,
            running: None,
        })
    }

    /// Replaces the control channel used to probe and query the service.
    pub fn with_control_channel<C>(mut self, channel: C) -> Self
    where
        C: ControlChannel + 'static,
    {
        self.channel = Box::new(channel);
        self
    }

    /// Replaces the process controller used to suspend and resume the service.
    pub fn with_process_controller<P>(mut self, controller: P) -> Self
    where
        P: ProcessController + 'static,
    {
        self.suspender = SuspendController::new(
            Box::new(controller),
            self.options.confirmation_timeout,
            self.options.confirmation_interval,
        );
        self
    }

    /// Returns the harness options.
    pub fn options(&self) -> &InstanceOptions {
        &self.options
    }

    /// Returns the state layout.
    pub fn layout(&self) -> &InstanceLayout {
        &self.layout
    }

    /// Returns the transport address of the service.
    pub fn address(&self) -> TransportAddress {
        self.layout.address()
    }

    /// Returns the domain socket path.
    pub fn unix_socket_path(&self) -> &Path {
        self.layout.unix_socket_path()
    }

    /// Returns the named pipe name.
    pub fn named_pipe_name(&self) -> &str {
        self.layout.named_pipe_name()
    }

    /// Returns the control channel.
    pub fn control_channel(&self) -> &dyn ControlChannel {
        self.channel.as_ref()
    }

    /// Sends a request to the service over its control channel.
    ///
    /// # Errors
    ///
    /// If the query fails, an error is returned.
    pub fn query(&self, request: &Value) -> Result<Value, ControlError> {
        self.channel.query(&self.layout.address(), request)
    }

    /// Returns the process identifier reported by the service.
    ///
    /// This is `None` until `start` has confirmed readiness, and again after `stop`.
    pub fn pid(&self) -> Option<Pid> {
        self.running.as_ref().and_then(|running| running.pid)
    }

    /// Returns how long the service process has been running, if there is one.
    pub fn uptime(&self) -> Option<Duration> {
        self.running.as_ref().map(|running| running.started_at.elapsed())
    }

    /// Returns `true` if a service process is tracked and has not exited.
    pub fn is_running(&mut self) -> bool {
        self.running
            .as_mut()
            .is_some_and(|running| matches!(running.child.try_wait(), Ok(None)))
    }

    /// Starts the service and waits for it to become ready.
    ///
    /// See [`start_with_env`][Self::start_with_env].
    ///
    /// # Errors
    ///
    /// If the service cannot be spawned or does not become ready in time, an error is returned.
    pub fn start(&mut self) -> Result<(), InstanceError> {
        self.start_with_env(std::iter::empty::<(&str, &str)>())
    }

    /// Starts the service with additional environment variables, and waits for it to become ready.
    ///
    /// The service inherits the environment of the current process, overlaid with the configuration file location and
    /// then `extra_env`. Its standard output and error are captured in a freshly truncated CLI log.
    ///
    /// Readiness means the service answered a process identifier query on its control channel. Subsystems that the
    /// service initializes after its control channel, such as filesystem watching, may still be starting up when this
    /// returns.
    ///
    /// If the service does not become ready, it is stopped before the error is returned.
    ///
    /// # Errors
    ///
    /// If a service process is already running, the CLI log cannot be created, the binary cannot be spawned, or the
    /// service does not become ready in time, an error is returned.
    pub fn start_with_env<I, K, V>(&mut self, extra_env: I) -> Result<(), InstanceError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        if let Some(running) = &self.running {
            return AlreadyStarted {
                child_id: running.child.id(),
            }
            .fail();
        }

        let cli_log_path = self.layout.cli_log_path();
        let stdout = File::create(cli_log_path).context(Provisioning { path: cli_log_path })?;
        let stderr = stdout.try_clone().context(Provisioning { path: cli_log_path })?;

        let mut command = Command::new(&self.options.binary);
        command
            .arg("--foreground")
            .arg(format!("--log-level={}", self.options.log_level))
            .args(self.layout.state_arguments())
            .env(&self.options.config_env_var, self.layout.config_path())
            .envs(extra_env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        let child = command.spawn().context(Spawn {
            binary: &self.options.binary,
        })?;
        let child_id = child.id();
        info!(binary = %self.options.binary.display(), child_id, "Spawned service process.");

        self.running = Some(RunningProcess {
            child,
            pid: None,
            started_at: Instant::now(),
        });

        if self.options.pause_after_spawn {
            pause_for_debugger(child_id);
        }

        let probe = ReadinessProbe::new(self.options.start_timeout, self.options.probe_interval);
        match probe.wait(self.channel.as_ref(), &self.layout.address()) {
            Ok(pid) => {
                if let Some(running) = self.running.as_mut() {
                    running.pid = Some(pid);
                }
                info!(pid, socket = %self.layout.unix_socket_path().display(), "Service is ready.");
                Ok(())
            }
            Err(e) => {
                warn!(child_id, error = %e, "Service did not become ready. Stopping it.");
                self.stop();
                Err(e)
            }
        }
    }

    /// Stops the service, if it is running.
    ///
    /// The process is killed and reaped. Calling this when no service process exists does nothing.
    pub fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };

        let child_id = running.child.id();
        debug!(child_id, pid = ?running.pid, "Stopping service process.");

        if let Err(e) = running.child.kill() {
            debug!(child_id, error = %e, "Service process had already exited.");
        }

        match running.child.wait() {
            Ok(status) => debug!(child_id, %status, uptime = ?running.started_at.elapsed(), "Service process exited."),
            Err(e) => warn!(child_id, error = %e, "Failed to reap service process."),
        }
    }

    /// Suspends the service process and waits until it is observed as stopped.
    ///
    /// # Errors
    ///
    /// If the service process is not running, an error is returned without attempting to suspend it. If the suspend
    /// request fails or is not observed within the confirmation timeout, an error is returned.
    pub fn suspend(&mut self) -> Result<(), InstanceError> {
        let pid = self.running_pid()?;
        debug!(pid, "Suspending service process.");
        self.suspender.suspend(pid)
    }

    /// Resumes the service process and waits until it is no longer observed as stopped.
    ///
    /// # Errors
    ///
    /// If the service process is not running, an error is returned without attempting to resume it. If the resume
    /// request fails or is not observed within the confirmation timeout, an error is returned.
    pub fn resume(&mut self) -> Result<(), InstanceError> {
        let pid = self.running_pid()?;
        debug!(pid, "Resuming service process.");
        self.suspender.resume(pid)
    }

    fn running_pid(&mut self) -> Result<Pid, InstanceError> {
        let running = self.running.as_mut().context(NotRunning {
            reason: "no service process has been started",
        })?;

        match running.child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                return NotRunning {
                    reason: format!("service process exited with {}", status),
                }
                .fail()
            }
            Err(e) => {
                return NotRunning {
                    reason: format!("failed to check service process status: {}", e),
                }
                .fail()
            }
        }

        let pid = running.pid.context(NotRunning {
            reason: "service readiness was never confirmed",
        })?;
        if is_placeholder_pid(pid) {
            return NotRunning {
                reason: format!("pid {} does not identify a controllable process", pid),
            }
            .fail();
        }

        Ok(pid)
    }

    /// Runs the service binary once, with the state arguments of this instance followed by `cmd`.
    ///
    /// See [`command_via_cli_with_prefix`][Self::command_via_cli_with_prefix].
    ///
    /// # Errors
    ///
    /// If the binary cannot be spawned, an error is returned.
    pub fn command_via_cli<C>(&self, cmd: &[C]) -> Result<CommandOutput, InstanceError>
    where
        C: AsRef<OsStr>,
    {
        self.command_via_cli_with_prefix::<&OsStr, C>(&[], cmd)
    }

    /// Runs the service binary once, wrapped in `prefix`, with the state arguments of this instance followed by
    /// `cmd`.
    ///
    /// When `prefix` is non-empty, its first element is the program that actually runs, and the service binary becomes
    /// one of its arguments. The configuration file location is set in the environment, and the variable that
    /// suppresses automatic server spawning is removed. This does not affect the long-lived service process.
    ///
    /// # Errors
    ///
    /// If the program cannot be spawned, an error is returned. A non-zero exit status is not an error.
    pub fn command_via_cli_with_prefix<P, C>(&self, prefix: &[P], cmd: &[C]) -> Result<CommandOutput, InstanceError>
    where
        P: AsRef<OsStr>,
        C: AsRef<OsStr>,
    {
        let mut command = match prefix.split_first() {
            Some((program, rest)) => {
                let mut command = Command::new(program);
                command.args(rest).arg(&self.options.binary);
                command
            }
            None => Command::new(&self.options.binary),
        };
        let program = PathBuf::from(command.get_program());

        command
            .arg(format!("--log-level={}", self.options.log_level))
            .args(self.layout.state_arguments())
            .args(cmd)
            .env(&self.options.config_env_var, self.layout.config_path())
            .env_remove(NO_SPAWN_ENV_VAR)
            .stdin(Stdio::null());

        debug!(program = %program.display(), "Running one-shot CLI invocation.");
        let output = command.output().context(Spawn { binary: program })?;

        Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Returns the contents of the service's own log file.
    ///
    /// # Errors
    ///
    /// If the log file cannot be read, an error is returned.
    pub fn server_log_contents(&self) -> Result<String, InstanceError> {
        read_log(self.layout.log_path())
    }

    /// Returns everything the service process wrote to standard output and error.
    ///
    /// This captures output produced before the service's own logging is initialized.
    ///
    /// # Errors
    ///
    /// If the log file cannot be read, an error is returned.
    pub fn cli_log_contents(&self) -> Result<String, InstanceError> {
        read_log(self.layout.cli_log_path())
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.stop();

        if self.options.retain_state {
            if let Some(state_dir) = self.state_dir.take() {
                let base_dir = state_dir.keep();
                info!(base_dir = %base_dir.display(), "Retaining instance state directory.");
            }
        }
    }
}

fn read_log(path: &Path) -> Result<String, InstanceError> {
    let contents = fs::read(path).context(ReadLog { path })?;
    Ok(String::from_utf8_lossy(&contents).into_owned())
}

fn pause_for_debugger(child_id: u32) {
    info!(child_id, "Service process spawned. Press Enter to continue.");

    let mut line = String::new();
    if let Err(e) = io::stdin().lock().read_line(&mut line) {
        warn!(error = %e, "Failed to read from standard input. Continuing.");
    }
}
