use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use stagehand_instance::LayoutStrategy;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Path to a JSON file with harness options.
    ///
    /// Options not set in the file fall back to their defaults, and any option can be overridden with a `STAGEHAND_`
    /// prefixed environment variable (`STAGEHAND_START_TIMEOUT=5`, etc).
    #[arg(global = true, long = "options")]
    pub options_path: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

#[derive(Subcommand)]
pub enum Action {
    /// Start an instance and keep it running until a line is read from standard input.
    #[command(name = "run")]
    Run(RunConfig),

    /// Run the service binary once against a fresh instance layout.
    #[command(name = "exec")]
    Exec(ExecConfig),

    /// Start an instance and repeatedly suspend and resume it.
    #[command(name = "pause-cycle")]
    PauseCycle(PauseCycleConfig),

    /// Launch the service binary in the foreground, detached from this process.
    #[command(name = "site-spawn")]
    SiteSpawn(SiteSpawnConfig),
}

/// Layout strategy selectable from the command line.
#[derive(Clone, Copy, ValueEnum)]
pub enum LayoutArg {
    /// Every artifact lives directly in the instance directory.
    File,

    /// The instance directory is passed to the service as its state directory.
    Directory,
}

impl From<LayoutArg> for LayoutStrategy {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::File => LayoutStrategy::FileState,
            LayoutArg::Directory => LayoutStrategy::DirectoryState,
        }
    }
}

/// Options describing the instance to create.
#[derive(Args, Clone)]
pub struct InstanceArgs {
    /// State layout strategy.
    ///
    /// Overrides the `layout` harness option.
    #[arg(long, value_enum)]
    pub layout: Option<LayoutArg>,

    /// Path to a JSON file whose object is written as the service configuration.
    ///
    /// Defaults to an empty configuration.
    #[arg(long)]
    pub service_config: Option<PathBuf>,
}

/// `run` configuration.
#[derive(Args, Clone)]
pub struct RunConfig {
    #[command(flatten)]
    pub instance: InstanceArgs,

    /// Additional environment variable for the service, as `KEY=VALUE`. (May be repeated.)
    #[arg(long = "env", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,
}

/// `exec` configuration.
#[derive(Args, Clone)]
pub struct ExecConfig {
    #[command(flatten)]
    pub instance: InstanceArgs,

    /// Program (and its leading arguments) to run the service binary through. (May be repeated.)
    #[arg(long = "prefix", allow_hyphen_values = true)]
    pub prefix: Vec<String>,

    /// Arguments passed to the service binary after the state arguments.
    #[arg(last = true)]
    pub args: Vec<String>,
}

/// `pause-cycle` configuration.
#[derive(Args, Clone)]
pub struct PauseCycleConfig {
    #[command(flatten)]
    pub instance: InstanceArgs,

    /// Number of suspend/resume cycles to perform.
    #[arg(long, default_value_t = 1)]
    pub cycles: u32,
}

/// `site-spawn` configuration.
#[derive(Args, Clone)]
pub struct SiteSpawnConfig {
    /// Arguments passed to the service binary after `--foreground`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}
