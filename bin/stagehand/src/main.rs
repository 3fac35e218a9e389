//! Operator CLI for running and poking at isolated service instances.

#![deny(warnings)]

use anyhow::Context as _;
use clap::Parser as _;
use stagehand_config::ConfigurationLoader;
use stagehand_instance::InstanceOptions;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
use self::config::{Action, Cli};

mod driver;
use self::driver::Driver;

const OPTIONS_ENV_PREFIX: &str = "STAGEHAND";

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(cli.log_level().into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .init();

    match run(cli) {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let options = load_options(&cli)?;
    let driver = Driver::new(options);

    match cli.action {
        Action::Run(config) => {
            info!("User requested 'run'. Starting instance...");
            driver.run(config)?;
            Ok(0)
        }
        Action::Exec(config) => {
            info!("User requested 'exec'.");
            driver.exec(config)
        }
        Action::PauseCycle(config) => {
            info!(cycles = config.cycles, "User requested 'pause-cycle'. Starting instance...");
            driver.pause_cycle(config)?;
            Ok(0)
        }
        Action::SiteSpawn(config) => {
            driver.site_spawn(config)?;
            Ok(0)
        }
    }
}

fn load_options(cli: &Cli) -> anyhow::Result<InstanceOptions> {
    let mut loader = ConfigurationLoader::default();
    if let Some(path) = &cli.options_path {
        loader = loader
            .from_json(path)
            .with_context(|| format!("Failed to load harness options from '{}'.", path.display()))?;
    }

    loader
        .from_environment(OPTIONS_ENV_PREFIX)?
        .into_typed()
        .context("Failed to load harness options.")
}
