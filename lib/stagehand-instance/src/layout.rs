//! Instance state layout.
//!
//! Every instance gets its own freshly created base directory, and all of the paths and addresses the service is told
//! to use are derived from it. Uniqueness of the base directory is what keeps concurrently running instances apart, so
//! nothing else in the layout needs to be coordinated.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt as _;
use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

use crate::{
    control::TransportAddress,
    error::{InstanceError, Provisioning},
};

const BASE_DIR_PREFIX: &str = "inst";
const NAMED_PIPE_PREFIX: &str = r"\\.\pipe\watchman-test-";
const UNUSED_NAMED_PIPE: &str = "INVALID";
const UNKNOWN_USER: &str = "unknown";

/// Where an instance keeps its configuration, logs, and transport endpoints.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum LayoutStrategy {
    /// Every artifact lives directly under the base directory, and each path is passed to the service individually.
    #[default]
    #[serde(rename = "file", alias = "file_state")]
    FileState,

    /// The base directory is handed to the service as its state directory, and the service keeps its live files in a
    /// per-user subdirectory of it.
    #[serde(rename = "directory", alias = "directory_state")]
    DirectoryState,
}

impl LayoutStrategy {
    /// Creates a fresh, uniquely named base directory under `temp_root` and derives a layout from it.
    ///
    /// The returned `TempDir` owns the base directory: it is removed when dropped.
    ///
    /// # Errors
    ///
    /// If the base directory cannot be created, an error is returned. There is no retry, as the directory name is
    /// random.
    pub fn provision(self, temp_root: &Path) -> Result<(TempDir, InstanceLayout), InstanceError> {
        let base_dir = tempfile::Builder::new()
            .prefix(BASE_DIR_PREFIX)
            .tempdir_in(temp_root)
            .context(Provisioning { path: temp_root })?;

        let layout = self.derive(base_dir.path());
        debug!(strategy = ?self, base_dir = %layout.base_dir().display(), "Provisioned instance state directory.");

        Ok((base_dir, layout))
    }

    /// Derives the layout rooted at an existing base directory.
    ///
    /// This does not touch the filesystem. Under [`DirectoryState`][Self::DirectoryState], the per-user subdirectory
    /// is named after the invoking user.
    pub fn derive(self, base_dir: &Path) -> InstanceLayout {
        let base_dir = base_dir.to_path_buf();
        match self {
            LayoutStrategy::FileState => InstanceLayout {
                strategy: self,
                config_path: base_dir.join("config.json"),
                log_path: base_dir.join("log"),
                cli_log_path: base_dir.join("cli-log"),
                pid_file_path: base_dir.join("pid"),
                state_file_path: base_dir.join("state"),
                unix_socket_path: base_dir.join("sock"),
                named_pipe_name: named_pipe_for(&base_dir),
                user_dir: None,
                base_dir,
            },
            LayoutStrategy::DirectoryState => {
                let user_name = process_control::current_user_name().unwrap_or_else(|| UNKNOWN_USER.to_string());
                let user_dir = base_dir.join(format!("{}-state", user_name));
                InstanceLayout {
                    strategy: self,
                    config_path: base_dir.join("config.json"),
                    log_path: user_dir.join("log"),
                    cli_log_path: base_dir.join("cli-log"),
                    pid_file_path: user_dir.join("pid"),
                    state_file_path: user_dir.join("state"),
                    unix_socket_path: user_dir.join("sock"),
                    named_pipe_name: UNUSED_NAMED_PIPE.to_string(),
                    user_dir: Some(user_dir),
                    base_dir,
                }
            }
        }
    }

    /// Builds the command-line flags that bind the service to the paths of `layout`.
    pub fn arguments(self, layout: &InstanceLayout) -> Vec<String> {
        match self {
            LayoutStrategy::FileState => vec![
                format!("--unix-listener-path={}", layout.unix_socket_path.display()),
                format!("--named-pipe-path={}", layout.named_pipe_name),
                format!("--logfile={}", layout.log_path.display()),
                format!("--statefile={}", layout.state_file_path.display()),
                format!("--pidfile={}", layout.pid_file_path.display()),
            ],
            LayoutStrategy::DirectoryState => vec![format!("--test-state-dir={}", layout.base_dir.display())],
        }
    }
}

/// Derives the named pipe for a base directory.
///
/// The name is a UUIDv5 of the directory path, so the same directory always maps to the same pipe.
pub fn named_pipe_for(base_dir: &Path) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, base_dir.to_string_lossy().as_bytes());
    format!("{}{}", NAMED_PIPE_PREFIX, id.simple())
}

/// Paths and addresses belonging to a single instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceLayout {
    strategy: LayoutStrategy,
    base_dir: PathBuf,
    user_dir: Option<PathBuf>,
    config_path: PathBuf,
    log_path: PathBuf,
    cli_log_path: PathBuf,
    pid_file_path: PathBuf,
    state_file_path: PathBuf,
    unix_socket_path: PathBuf,
    named_pipe_name: String,
}

impl InstanceLayout {
    /// Returns the strategy this layout was derived with.
    pub fn strategy(&self) -> LayoutStrategy {
        self.strategy
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the per-user state subdirectory, if the strategy uses one.
    ///
    /// The subdirectory is created by the service, not by the harness.
    pub fn user_dir(&self) -> Option<&Path> {
        self.user_dir.as_deref()
    }

    /// Returns the path of the service configuration file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Returns the path of the service's own log file.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Returns the path of the file capturing the service's standard output and error.
    pub fn cli_log_path(&self) -> &Path {
        &self.cli_log_path
    }

    /// Returns the path of the service's pid file.
    pub fn pid_file_path(&self) -> &Path {
        &self.pid_file_path
    }

    /// Returns the path of the service's state file.
    pub fn state_file_path(&self) -> &Path {
        &self.state_file_path
    }

    /// Returns the domain socket path.
    pub fn unix_socket_path(&self) -> &Path {
        &self.unix_socket_path
    }

    /// Returns the named pipe name.
    ///
    /// Under [`LayoutStrategy::DirectoryState`], this is a placeholder that no service listens on.
    pub fn named_pipe_name(&self) -> &str {
        &self.named_pipe_name
    }

    /// Returns the transport address of the service.
    pub fn address(&self) -> TransportAddress {
        TransportAddress::new(&self.unix_socket_path, &self.named_pipe_name)
    }

    /// Returns the command-line flags that bind the service to this layout.
    pub fn state_arguments(&self) -> Vec<String> {
        self.strategy.arguments(self)
    }
}
