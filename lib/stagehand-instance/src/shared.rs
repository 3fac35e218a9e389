use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::{error::InstanceError, instance::Instance, options::InstanceOptions, service_config::ServiceConfig};

/// A lazily started instance shared by everything in a test run.
///
/// The holder is created explicitly by whatever owns the run, starts its instance on first use, and must be torn down
/// explicitly with [`teardown`][Self::teardown] when the run ends. Dropping the holder also stops the instance.
pub struct SharedInstance {
    options: InstanceOptions,
    config: ServiceConfig,
    slot: Mutex<Option<Instance>>,
}

impl SharedInstance {
    /// Creates a new, empty `SharedInstance` that will start instances with the given options and configuration.
    pub fn new(options: InstanceOptions, config: ServiceConfig) -> Self {
        Self {
            options,
            config,
            slot: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Instance>> {
        // A panic while holding the lock leaves the instance itself intact.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if an instance has been started or installed.
    pub fn has_instance(&self) -> bool {
        self.lock().is_some()
    }

    /// Installs an already started instance, returning the one it replaces, if any.
    pub fn install(&self, instance: Instance) -> Option<Instance> {
        self.lock().replace(instance)
    }

    /// Runs `f` with the shared instance, starting it first if there is none yet.
    ///
    /// Access is serialized: concurrent callers wait for each other.
    ///
    /// # Errors
    ///
    /// If there is no instance yet and starting one fails, an error is returned and the holder stays empty.
    pub fn with<F, R>(&self, f: F) -> Result<R, InstanceError>
    where
        F: FnOnce(&mut Instance) -> R,
    {
        let mut slot = self.lock();
        let instance = match slot.take() {
            Some(instance) => instance,
            None => {
                debug!("Starting shared instance.");
                let mut instance = Instance::new(self.options.clone(), &self.config)?;
                instance.start()?;
                instance
            }
        };

        Ok(f(slot.insert(instance)))
    }

    /// Stops and discards the shared instance, if there is one.
    pub fn teardown(&self) {
        if let Some(mut instance) = self.lock().take() {
            info!(pid = ?instance.pid(), "Tearing down shared instance.");
            instance.stop();
        }
    }
}

impl Drop for SharedInstance {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        path::{Path, PathBuf},
        thread,
        time::Duration,
    };

    use process_control::Pid;
    use serde_json::{json, Value};

    use super::*;
    use crate::control::{ControlChannel, ControlError, TransportAddress};

    struct Answering;

    impl ControlChannel for Answering {
        fn query(&self, _address: &TransportAddress, _request: &Value) -> Result<Value, ControlError> {
            Ok(json!({ "pid": 4242 }))
        }
    }

    fn options_in(root: &Path, binary: &str) -> InstanceOptions {
        InstanceOptions {
            binary: PathBuf::from(binary),
            temp_root: Some(root.to_path_buf()),
            start_timeout: Duration::from_millis(100),
            probe_interval: Duration::from_millis(10),
            ..InstanceOptions::default()
        }
    }

    #[test]
    fn failed_start_leaves_holder_empty() {
        let root = tempfile::tempdir().unwrap();
        let shared = SharedInstance::new(options_in(root.path(), "/nonexistent/watchman"), ServiceConfig::new());

        assert!(!shared.has_instance());
        assert!(shared.with(|instance| instance.pid()).is_err());
        assert!(!shared.has_instance());
    }

    #[test]
    fn installed_instance_is_reused() {
        let root = tempfile::tempdir().unwrap();
        let shared = SharedInstance::new(options_in(root.path(), "/nonexistent/watchman"), ServiceConfig::new());

        let mut instance = Instance::new(options_in(root.path(), "sleep"), &ServiceConfig::new())
            .unwrap()
            .with_control_channel(Answering);
        instance.start().unwrap();
        let base_dir = instance.layout().base_dir().to_path_buf();
        assert!(shared.install(instance).is_none());

        let seen = thread::scope(|scope| {
            let handles = (0..4)
                .map(|_| scope.spawn(|| shared.with(|instance| instance.layout().base_dir().to_path_buf())))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap().unwrap())
                .collect::<Vec<_>>()
        });
        assert!(seen.iter().all(|dir| *dir == base_dir));

        let pid: Option<Pid> = shared.with(|instance| instance.pid()).unwrap();
        assert_eq!(pid, Some(4242));

        shared.teardown();
        assert!(!shared.has_instance());
        shared.teardown();
    }

    #[test]
    fn holder_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SharedInstance>();
    }
}
