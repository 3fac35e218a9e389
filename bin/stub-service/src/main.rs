//! A minimal stand-in for the watched service.
//!
//! Accepts the same state arguments as the real service, reads the configuration file named by `WATCHMAN_CONFIG_FILE`,
//! writes its pid, log, and state files, and answers `get-pid`, `version`, and `get-config` over its domain socket.
//! Setting `STUB_SERVICE_NEVER_LISTEN=1` makes it sleep forever without ever binding the socket.
//!
//! Without `--foreground`, the trailing arguments are treated as a one-shot command: a JSON description of the
//! invocation is printed and the process exits.

#[cfg(unix)]
fn main() {
    if let Err(e) = stub::run() {
        eprintln!("stub-service: {:?}", e);
        std::process::exit(1);
    }
}

#[cfg(not(unix))]
fn main() {
    eprintln!("stub-service: only supported on Unix platforms");
    std::process::exit(1);
}

#[cfg(unix)]
mod stub {
    use std::{
        fs::{self, File},
        io::{BufRead as _, BufReader, Write as _},
        os::unix::net::{UnixListener, UnixStream},
        path::{Path, PathBuf},
        sync::Mutex,
        thread,
        time::Duration,
    };

    use anyhow::Context as _;
    use clap::Parser;
    use serde_json::{json, Map, Value};
    use tracing::{debug, info, level_filters::LevelFilter, warn};

    const CONFIG_ENV_VAR: &str = "WATCHMAN_CONFIG_FILE";
    const NEVER_LISTEN_ENV_VAR: &str = "STUB_SERVICE_NEVER_LISTEN";
    const NO_SPAWN_ENV_VAR: &str = "WATCHMAN_NO_SPAWN";

    #[derive(Parser)]
    struct Args {
        /// Run as the long-lived service.
        #[arg(long)]
        foreground: bool,

        #[arg(long, default_value_t = 1)]
        log_level: u8,

        #[arg(long)]
        unix_listener_path: Option<PathBuf>,

        #[arg(long)]
        named_pipe_path: Option<String>,

        #[arg(long)]
        logfile: Option<PathBuf>,

        #[arg(long)]
        statefile: Option<PathBuf>,

        #[arg(long)]
        pidfile: Option<PathBuf>,

        #[arg(long)]
        test_state_dir: Option<PathBuf>,

        /// One-shot command.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    }

    struct Paths {
        socket: PathBuf,
        log: PathBuf,
        state: PathBuf,
        pid: PathBuf,
    }

    impl Args {
        fn paths(&self) -> anyhow::Result<Paths> {
            if let Some(state_dir) = &self.test_state_dir {
                let user = process_control::current_user_name().unwrap_or_else(|| "unknown".to_string());
                let user_dir = state_dir.join(format!("{}-state", user));
                return Ok(Paths {
                    socket: user_dir.join("sock"),
                    log: user_dir.join("log"),
                    state: user_dir.join("state"),
                    pid: user_dir.join("pid"),
                });
            }

            Ok(Paths {
                socket: self
                    .unix_listener_path
                    .clone()
                    .context("--unix-listener-path or --test-state-dir is required")?,
                log: self.logfile.clone().context("--logfile is required")?,
                state: self.statefile.clone().context("--statefile is required")?,
                pid: self.pidfile.clone().context("--pidfile is required")?,
            })
        }

        fn level_filter(&self) -> LevelFilter {
            match self.log_level {
                0 => LevelFilter::ERROR,
                1 => LevelFilter::INFO,
                _ => LevelFilter::DEBUG,
            }
        }
    }

    fn read_config() -> anyhow::Result<Map<String, Value>> {
        let path = std::env::var_os(CONFIG_ENV_VAR).with_context(|| format!("{} is not set", CONFIG_ENV_VAR))?;
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read configuration from '{}'", Path::new(&path).display()))?;
        serde_json::from_str(&raw).context("configuration is not a JSON object")
    }

    pub fn run() -> anyhow::Result<()> {
        let args = Args::parse();
        let paths = args.paths()?;
        let config = read_config()?;

        if !args.foreground {
            let description = json!({
                "sockname": paths.socket,
                "named_pipe": args.named_pipe_path,
                "command": args.command,
                "no_spawn": std::env::var_os(NO_SPAWN_ENV_VAR).is_some(),
            });
            println!("{}", description);
            return Ok(());
        }

        // Written to standard output, which ends up in the CLI log.
        println!("stub-service {} starting", std::process::id());

        if let Some(dir) = paths.socket.parent() {
            fs::create_dir_all(dir).with_context(|| format!("failed to create '{}'", dir.display()))?;
        }

        let log = File::create(&paths.log).with_context(|| format!("failed to create '{}'", paths.log.display()))?;
        tracing_subscriber::fmt()
            .with_max_level(args.level_filter())
            .with_writer(Mutex::new(log))
            .with_ansi(false)
            .init();

        fs::write(&paths.pid, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write '{}'", paths.pid.display()))?;
        fs::write(&paths.state, "{}\n").with_context(|| format!("failed to write '{}'", paths.state.display()))?;
        info!(pid = std::process::id(), keys = config.len(), "Loaded configuration.");

        if std::env::var_os(NEVER_LISTEN_ENV_VAR).is_some_and(|value| value == "1") {
            info!("Never listening, as requested.");
            loop {
                thread::sleep(Duration::from_secs(3600));
            }
        }

        let _ = fs::remove_file(&paths.socket);
        let listener = UnixListener::bind(&paths.socket)
            .with_context(|| format!("failed to bind '{}'", paths.socket.display()))?;
        info!(socket = %paths.socket.display(), "Listening.");

        let config = Value::Object(config);
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let config = config.clone();
                    thread::spawn(move || {
                        if let Err(e) = serve(stream, &config) {
                            warn!(error = %e, "Connection failed.");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection."),
            }
        }

        Ok(())
    }

    fn serve(stream: UnixStream, config: &Value) -> anyhow::Result<()> {
        let mut writer = stream.try_clone()?;
        for line in BufReader::new(stream).lines() {
            let line = line?;
            let response = match serde_json::from_str::<Value>(&line) {
                Ok(request) => respond(&request, config),
                Err(e) => json!({ "error": format!("invalid request: {}", e) }),
            };

            debug!(request = %line, %response, "Answered request.");
            writeln!(writer, "{}", response)?;
        }

        Ok(())
    }

    fn respond(request: &Value, config: &Value) -> Value {
        let version = env!("CARGO_PKG_VERSION");
        match request.get(0).and_then(Value::as_str) {
            Some("get-pid") => json!({ "version": version, "pid": std::process::id() }),
            Some("version") => json!({ "version": version }),
            Some("get-config") => json!({ "version": version, "config": config }),
            Some(other) => json!({ "version": version, "error": format!("unknown command '{}'", other) }),
            None => json!({ "version": version, "error": "request must be a non-empty array" }),
        }
    }
}
