use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{formats::Flexible, serde_as, DurationMilliSeconds, DurationSecondsWithFrac};

use crate::layout::LayoutStrategy;

const BINARY_ENV_VAR: &str = "WATCHMAN_BINARY";
const DEFAULT_BINARY: &str = "watchman";
const DEFAULT_CONFIG_ENV_VAR: &str = "WATCHMAN_CONFIG_FILE";

/// Harness options for an instance.
///
/// All fields have defaults, so a partial configuration source only needs to name what it changes.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct InstanceOptions {
    /// Path to the service binary.
    ///
    /// Defaults to the value of `WATCHMAN_BINARY`, or `watchman` if that is not set.
    pub binary: PathBuf,

    /// How long to wait for the service to answer on its control channel after spawning it.
    ///
    /// Expressed in (fractional) seconds. Defaults to 60 seconds.
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub start_timeout: Duration,

    /// Interval between readiness probes.
    ///
    /// Expressed in milliseconds. Defaults to 100 milliseconds.
    #[serde_as(as = "DurationMilliSeconds<u64, Flexible>")]
    pub probe_interval: Duration,

    /// How long to wait for a suspend or resume to be observed.
    ///
    /// Expressed in (fractional) seconds. Defaults to 5 seconds.
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub confirmation_timeout: Duration,

    /// Interval between scheduling state checks while confirming a suspend or resume.
    ///
    /// Expressed in milliseconds. Defaults to 30 milliseconds.
    #[serde_as(as = "DurationMilliSeconds<u64, Flexible>")]
    pub confirmation_interval: Duration,

    /// Log level passed to the service with `--log-level`.
    ///
    /// Defaults to 2.
    pub log_level: u8,

    /// Environment variable through which the service learns where its configuration file is.
    ///
    /// Defaults to `WATCHMAN_CONFIG_FILE`.
    pub config_env_var: String,

    /// State layout strategy.
    pub layout: LayoutStrategy,

    /// Directory under which base directories are created.
    ///
    /// Defaults to the system temporary directory.
    pub temp_root: Option<PathBuf>,

    /// Whether to keep the base directory after the instance is dropped.
    pub retain_state: bool,

    /// Whether to block after spawning the service until a line is read from standard input.
    ///
    /// This leaves time to attach a debugger before readiness probing begins.
    pub pause_after_spawn: bool,
}

impl InstanceOptions {
    /// Returns the directory under which base directories are created.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            binary: std::env::var_os(BINARY_ENV_VAR)
                .filter(|binary| !binary.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY)),
            start_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_millis(100),
            confirmation_timeout: Duration::from_secs(5),
            confirmation_interval: Duration::from_millis(30),
            log_level: 2,
            config_env_var: DEFAULT_CONFIG_ENV_VAR.to_string(),
            layout: LayoutStrategy::FileState,
            temp_root: None,
            retain_state: false,
            pause_after_spawn: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn partial_options_keep_defaults() {
        let options: InstanceOptions = serde_json::from_value(json!({
            "start_timeout": 2.5,
            "probe_interval": 20,
            "layout": "directory",
        }))
        .unwrap();

        let defaults = InstanceOptions::default();
        assert_eq!(options.start_timeout, Duration::from_millis(2500));
        assert_eq!(options.probe_interval, Duration::from_millis(20));
        assert_eq!(options.layout, LayoutStrategy::DirectoryState);
        assert_eq!(options.confirmation_timeout, defaults.confirmation_timeout);
        assert_eq!(options.config_env_var, "WATCHMAN_CONFIG_FILE");
        assert_eq!(options.log_level, 2);
    }

    #[test]
    fn durations_accept_strings() {
        let options: InstanceOptions = serde_json::from_value(json!({
            "confirmation_timeout": "0.5",
            "confirmation_interval": "10",
        }))
        .unwrap();

        assert_eq!(options.confirmation_timeout, Duration::from_millis(500));
        assert_eq!(options.confirmation_interval, Duration::from_millis(10));
    }

    #[test]
    fn unknown_layout_rejected() {
        let result = serde_json::from_value::<InstanceOptions>(json!({ "layout": "sideways" }));
        assert!(result.is_err());
    }

    #[test]
    fn temp_root_falls_back_to_system_temp() {
        let mut options = InstanceOptions::default();
        assert_eq!(options.temp_root(), std::env::temp_dir());

        options.temp_root = Some(PathBuf::from("/scratch"));
        assert_eq!(options.temp_root(), PathBuf::from("/scratch"));
    }
}
