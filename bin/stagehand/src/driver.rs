use std::{
    io::{self, BufRead as _, Write as _},
    process::{Command, Stdio},
    time::Instant,
};

use anyhow::{bail, Context as _};
use stagehand_instance::{Instance, InstanceOptions, ServiceConfig};
use tracing::{debug, info, warn};

use crate::config::{ExecConfig, InstanceArgs, PauseCycleConfig, RunConfig, SiteSpawnConfig};

/// Runs CLI actions against instances built from a common set of harness options.
pub struct Driver {
    options: InstanceOptions,
}

impl Driver {
    pub fn new(options: InstanceOptions) -> Self {
        Self { options }
    }

    fn create_instance(&self, args: &InstanceArgs) -> anyhow::Result<Instance> {
        let mut options = self.options.clone();
        if let Some(layout) = args.layout {
            options.layout = layout.into();
        }

        let config = match &args.service_config {
            Some(path) => ServiceConfig::read_from(path)?,
            None => ServiceConfig::new(),
        };

        let instance = Instance::new(options, &config)?;
        debug!(base_dir = %instance.layout().base_dir().display(), "Created instance.");
        Ok(instance)
    }

    /// Starts an instance, reports where it can be reached, and keeps it running until standard input yields a line or
    /// is closed.
    pub fn run(&self, config: RunConfig) -> anyhow::Result<()> {
        let mut instance = self.create_instance(&config.instance)?;
        instance.start_with_env(config.env)?;

        let layout = instance.layout();
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "pid={}", instance.pid().unwrap_or_default())?;
        writeln!(stdout, "base_dir={}", layout.base_dir().display())?;
        writeln!(stdout, "sockname={}", layout.unix_socket_path().display())?;
        writeln!(stdout, "named_pipe={}", layout.named_pipe_name())?;
        writeln!(stdout, "log={}", layout.log_path().display())?;
        writeln!(stdout, "cli_log={}", layout.cli_log_path().display())?;
        stdout.flush()?;
        drop(stdout);

        info!("Instance is ready. Press Enter (or close standard input) to stop it.");
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read from standard input.")?;

        info!("Stopping instance...");
        instance.stop();
        Ok(())
    }

    /// Runs the service binary once and relays its output, returning its exit code.
    pub fn exec(&self, config: ExecConfig) -> anyhow::Result<i32> {
        let instance = self.create_instance(&config.instance)?;
        let output = instance.command_via_cli_with_prefix(&config.prefix, &config.args)?;

        io::stdout().write_all(&output.stdout)?;
        io::stderr().write_all(&output.stderr)?;

        match output.status.code() {
            Some(code) => Ok(code),
            None => {
                warn!(status = %output.status, "Service binary was terminated by a signal.");
                Ok(1)
            }
        }
    }

    /// Starts an instance and suspends and resumes it the requested number of times, reporting how long each
    /// transition took to confirm.
    pub fn pause_cycle(&self, config: PauseCycleConfig) -> anyhow::Result<()> {
        let mut instance = self.create_instance(&config.instance)?;
        instance.start()?;

        for cycle in 1..=config.cycles {
            let started = Instant::now();
            instance.suspend()?;
            let suspended_after = started.elapsed();

            let started = Instant::now();
            instance.resume()?;
            let resumed_after = started.elapsed();

            info!(cycle, ?suspended_after, ?resumed_after, "Completed suspend/resume cycle.");
        }

        if instance.control_channel().get_pid(&instance.address()).is_err() {
            bail!("Service stopped answering after being resumed.");
        }

        instance.stop();
        Ok(())
    }

    /// Launches `<binary> --foreground <args>` without waiting for it.
    pub fn site_spawn(&self, config: SiteSpawnConfig) -> anyhow::Result<()> {
        let child = Command::new(&self.options.binary)
            .arg("--foreground")
            .args(&config.args)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'.", self.options.binary.display()))?;

        info!(binary = %self.options.binary.display(), child_id = child.id(), "Spawned service process.");
        Ok(())
    }
}
