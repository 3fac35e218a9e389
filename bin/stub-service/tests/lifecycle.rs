//! End-to-end lifecycle tests against the stub service.
#![cfg(unix)]

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use process_control::{platform_controller, Pid, ProcessControlError, ProcessController, SchedulingState};
use serde_json::{json, Value};
use stagehand_instance::{
    poll::wait_for, ControlChannel, ControlError, Instance, InstanceError, InstanceOptions, LayoutStrategy, Phase,
    ServiceConfig, TransportAddress,
};

fn stub_options(root: &Path) -> InstanceOptions {
    InstanceOptions {
        binary: PathBuf::from(env!("CARGO_BIN_EXE_stub-service")),
        temp_root: Some(root.to_path_buf()),
        start_timeout: Duration::from_secs(20),
        probe_interval: Duration::from_millis(20),
        ..InstanceOptions::default()
    }
}

fn process_exists(pid: Pid) -> bool {
    let pid = libc::pid_t::try_from(pid).expect("pid fits in pid_t");

    // SAFETY: Signal 0 only checks whether the process exists and may be signalled.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[derive(Clone, Default)]
struct RecordingController {
    requests: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingController {
    fn requests(&self) -> Vec<&'static str> {
        self.requests.lock().unwrap().clone()
    }
}

impl ProcessController for RecordingController {
    fn suspend(&self, _pid: Pid) -> Result<(), ProcessControlError> {
        self.requests.lock().unwrap().push("suspend");
        Ok(())
    }

    fn resume(&self, _pid: Pid) -> Result<(), ProcessControlError> {
        self.requests.lock().unwrap().push("resume");
        Ok(())
    }

    fn scheduling_state(&self, _pid: Pid) -> Result<SchedulingState, ProcessControlError> {
        Ok(SchedulingState::Unobservable)
    }
}

#[test]
fn start_reports_pid_and_config() {
    let root = tempfile::tempdir().unwrap();
    let config = ServiceConfig::new()
        .with("flag", true)
        .with("ignore_dirs", json!(["buck-out", ".hg"]))
        .with("settle", 20);

    let mut instance = Instance::new(stub_options(root.path()), &config).unwrap();
    instance.start().unwrap();

    let pid = instance.pid().expect("pid after start");
    assert!(pid > 1);
    assert_eq!(instance.control_channel().get_pid(&instance.address()).unwrap(), pid);
    assert_eq!(
        ServiceConfig::read_from(instance.layout().config_path()).unwrap(),
        config
    );

    let reported = instance.query(&json!(["get-config"])).unwrap();
    assert_eq!(reported["config"], Value::Object(config.as_map().clone()));

    assert!(instance.server_log_contents().unwrap().contains("Listening"));
    assert!(instance
        .cli_log_contents()
        .unwrap()
        .contains(&format!("stub-service {} starting", pid)));
    assert_eq!(
        std::fs::read_to_string(instance.layout().pid_file_path()).unwrap().trim(),
        pid.to_string()
    );
}

#[test]
fn stop_is_idempotent() {
    let root = tempfile::tempdir().unwrap();
    let mut instance = Instance::new(stub_options(root.path()), &ServiceConfig::new()).unwrap();
    instance.stop();

    instance.start().unwrap();
    let pid = instance.pid().unwrap();

    instance.stop();
    instance.stop();
    assert_eq!(instance.pid(), None);
    assert!(!instance.is_running());
    assert!(!process_exists(pid));

    let error = instance.control_channel().get_pid(&instance.address()).unwrap_err();
    assert!(error.is_connect_failure());
}

#[test]
fn dropping_during_a_panic_stops_the_service() {
    let root = tempfile::tempdir().unwrap();
    let observed = Arc::new(Mutex::new(None));

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut instance = Instance::new(stub_options(root.path()), &ServiceConfig::new()).unwrap();
        instance.start().unwrap();
        *observed.lock().unwrap() = instance.pid();
        panic!("scenario failed");
    }));

    assert!(result.is_err());
    let pid = observed.lock().unwrap().expect("service was started");
    assert!(!process_exists(pid));
}

#[test]
fn suspend_and_resume() {
    let root = tempfile::tempdir().unwrap();
    let mut instance = Instance::new(stub_options(root.path()), &ServiceConfig::new()).unwrap();
    instance.start().unwrap();
    let pid = instance.pid().unwrap();
    let observer = platform_controller();

    instance.suspend().unwrap();
    assert_eq!(observer.scheduling_state(pid).unwrap(), SchedulingState::Stopped);

    let started = Instant::now();
    instance.suspend().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    instance.resume().unwrap();
    assert_eq!(observer.scheduling_state(pid).unwrap(), SchedulingState::Running);
    assert_eq!(instance.control_channel().get_pid(&instance.address()).unwrap(), pid);
}

#[test]
fn suspended_service_is_still_stopped_by_teardown() {
    let root = tempfile::tempdir().unwrap();
    let mut instance = Instance::new(stub_options(root.path()), &ServiceConfig::new()).unwrap();
    instance.start().unwrap();
    let pid = instance.pid().unwrap();

    instance.suspend().unwrap();
    instance.stop();
    assert!(!process_exists(pid));
}

#[test]
fn exited_service_is_not_signalled() {
    let root = tempfile::tempdir().unwrap();
    let controller = RecordingController::default();
    let mut instance = Instance::new(stub_options(root.path()), &ServiceConfig::new())
        .unwrap()
        .with_process_controller(controller.clone());
    instance.start().unwrap();
    let pid = instance.pid().unwrap();

    let raw_pid = libc::pid_t::try_from(pid).unwrap();
    // SAFETY: `raw_pid` is the service process we just started.
    assert_eq!(unsafe { libc::kill(raw_pid, libc::SIGKILL) }, 0);
    assert!(wait_for(Duration::from_secs(10), Duration::from_millis(10), || !instance.is_running()));

    for result in [instance.suspend(), instance.resume()] {
        let error = result.unwrap_err();
        assert!(matches!(error, InstanceError::NotRunning { .. }));
        assert_eq!(error.phase(), Phase::Precondition);
    }
    assert!(controller.requests().is_empty());
}

/// Reports a placeholder pid instead of the real one.
struct PlaceholderPid;

impl ControlChannel for PlaceholderPid {
    fn query(&self, _address: &TransportAddress, _request: &Value) -> Result<Value, ControlError> {
        Ok(json!({ "pid": 1 }))
    }
}

#[test]
fn placeholder_pid_is_not_signalled() {
    let root = tempfile::tempdir().unwrap();
    let controller = RecordingController::default();
    let mut instance = Instance::new(stub_options(root.path()), &ServiceConfig::new())
        .unwrap()
        .with_control_channel(PlaceholderPid)
        .with_process_controller(controller.clone());
    instance.start().unwrap();

    let error = instance.suspend().unwrap_err();
    assert!(matches!(error, InstanceError::NotRunning { .. }));
    assert!(controller.requests().is_empty());
}

#[test]
fn service_that_never_listens() {
    let root = tempfile::tempdir().unwrap();
    let mut options = stub_options(root.path());
    options.start_timeout = Duration::from_secs(5);
    let mut instance = Instance::new(options, &ServiceConfig::new()).unwrap();

    let started = Instant::now();
    let error = instance
        .start_with_env([("STUB_SERVICE_NEVER_LISTEN", "1")])
        .unwrap_err();
    assert!(started.elapsed() >= Duration::from_secs(5));

    assert_eq!(error.phase(), Phase::Readiness);
    match &error {
        InstanceError::ReadinessTimeout { source, .. } => assert!(source.is_connect_failure()),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!instance.is_running());
    assert_eq!(instance.pid(), None);

    let stub_pid: Pid = std::fs::read_to_string(instance.layout().pid_file_path())
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!process_exists(stub_pid));
}

#[test]
fn config_survives_teardown() {
    let root = tempfile::tempdir().unwrap();
    let config = ServiceConfig::new().with("flag", true);
    let mut instance = Instance::new(stub_options(root.path()), &config).unwrap();

    instance.start().unwrap();
    instance.stop();

    assert_eq!(
        ServiceConfig::read_from(instance.layout().config_path()).unwrap(),
        config
    );
    assert!(instance.server_log_contents().unwrap().contains("Loaded configuration"));
}

#[test]
fn directory_state_layout() {
    let root = tempfile::tempdir().unwrap();
    let mut options = stub_options(root.path());
    options.layout = LayoutStrategy::DirectoryState;
    let mut instance = Instance::new(options, &ServiceConfig::new()).unwrap();

    instance.start().unwrap();

    let user_dir = instance.layout().user_dir().expect("user dir").to_path_buf();
    assert!(user_dir.is_dir());
    assert!(instance.unix_socket_path().starts_with(&user_dir));
    assert_eq!(instance.named_pipe_name(), "INVALID");
    assert!(instance.server_log_contents().unwrap().contains("Listening"));
}

#[test]
fn one_shot_cli_invocation() {
    let root = tempfile::tempdir().unwrap();
    let instance = Instance::new(stub_options(root.path()), &ServiceConfig::new()).unwrap();

    let output = instance.command_via_cli(&["get-sockname"]).unwrap();
    assert!(output.success(), "stderr: {}", output.stderr_lossy());

    let described: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(described["command"], json!(["get-sockname"]));
    assert_eq!(described["no_spawn"], json!(false));
    assert_eq!(
        described["sockname"],
        json!(instance.unix_socket_path().display().to_string())
    );
    assert_eq!(instance.pid(), None);
}

#[test]
fn start_twice_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let mut instance = Instance::new(stub_options(root.path()), &ServiceConfig::new()).unwrap();
    instance.start().unwrap();
    let pid = instance.pid();

    let error = instance.start().unwrap_err();
    assert!(matches!(error, InstanceError::AlreadyStarted { .. }));
    assert_eq!(instance.pid(), pid);
}
