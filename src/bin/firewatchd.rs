//! firewatchd - fire-sensor ingestion and monitor broadcast daemon
//!
//! # Usage
//!
//! ```bash
//! # Everything in one process (foreground)
//! firewatchd start
//!
//! # Split deployment: ingestion and monitor serving as separate daemons
//! firewatchd start --mode ingest -d
//! firewatchd start --mode relay -d
//!
//! # Stop or inspect a daemon
//! firewatchd stop --mode relay
//! firewatchd status --mode ingest
//! ```
//!
//! Secrets come from `FIREWATCH_SENSOR_SECRET` and `FIREWATCH_MONITOR_SECRET`.

use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use firewatch_core::SecretHash;
use firewatchd::config::{
    secret_from_env, DaemonConfig, Secrets, ENV_MONITOR_SECRET, ENV_SENSOR_SECRET,
};
use firewatchd::dispatch::NotificationDispatcher;
use firewatchd::handoff::{
    run_publisher, FileHandoffReader, FileHandoffWriter, RegistryHandoff, SnapshotMirror,
};
use firewatchd::monitors::MonitorRegistry;
use firewatchd::registry::{spawn_registry_with_capacity, RegistryHandle};
use firewatchd::relay::run_relay;
use firewatchd::server::{MonitorServer, SensorServer, SessionConfig};
use firewatchd::service::{FireAlarmService, SensorSource};

/// firewatch daemon - fire-sensor telemetry ingestion and monitor fan-out
#[derive(Parser, Debug)]
#[command(name = "firewatchd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Which half of the system to run
        #[arg(long, value_enum, default_value_t = Mode::All)]
        mode: Mode,

        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Stop a running daemon
    Stop {
        #[arg(long, value_enum, default_value_t = Mode::All)]
        mode: Mode,
    },
    /// Show daemon status
    Status {
        #[arg(long, value_enum, default_value_t = Mode::All)]
        mode: Mode,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Sensor server, monitor server and in-process relay
    All,
    /// Sensor server writing to the handoff directory
    Ingest,
    /// Monitor server reading from the handoff directory
    Relay,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Ingest => write!(f, "ingest"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// Hashed secrets a mode needs.
struct ModeSecrets {
    sensor: Option<SecretHash>,
    monitor: Option<SecretHash>,
}

impl ModeSecrets {
    fn from_env(mode: Mode) -> Result<Self> {
        Ok(match mode {
            Mode::All => {
                let Secrets { sensor, monitor } = Secrets::from_env()?;
                Self {
                    sensor: Some(sensor),
                    monitor: Some(monitor),
                }
            }
            Mode::Ingest => Self {
                sensor: Some(secret_from_env(ENV_SENSOR_SECRET)?),
                monitor: None,
            },
            Mode::Relay => Self {
                sensor: None,
                monitor: Some(secret_from_env(ENV_MONITOR_SECRET)?),
            },
        })
    }
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("firewatch")
}

fn pid_file_path(mode: Mode) -> PathBuf {
    state_dir().join(format!("firewatchd-{mode}.pid"))
}

fn log_file_path(mode: Mode) -> PathBuf {
    state_dir().join(format!("firewatchd-{mode}.log"))
}

fn read_pid(mode: Mode) -> Option<u32> {
    let mut file = File::open(pid_file_path(mode)).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid(mode: Mode) -> Result<()> {
    let path = pid_file_path(mode);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file(mode: Mode) {
    let _ = fs::remove_file(pid_file_path(mode));
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running(mode: Mode) -> Option<u32> {
    if let Some(pid) = read_pid(mode) {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file(mode);
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        mode: Mode::All,
        daemon: false,
        config: None,
    });

    match command {
        Command::Start {
            mode,
            daemon,
            config,
        } => {
            if let Some(pid) = is_daemon_running(mode) {
                eprintln!("Daemon ({mode}) is already running (PID {pid})");
                eprintln!("Use 'firewatchd stop --mode {mode}' to stop it first.");
                process::exit(1);
            }

            // Fail in the foreground on bad config or missing secrets
            let config =
                DaemonConfig::load(config.as_deref()).context("Failed to load configuration")?;
            let secrets = ModeSecrets::from_env(mode)?;

            if daemon {
                daemonize(mode)?;
            }

            write_pid(mode)?;
            let result = run_daemon(mode, config, secrets);
            remove_pid_file(mode);

            result
        }
        Command::Stop { mode } => {
            if let Some(pid) = is_daemon_running(mode) {
                println!("Stopping daemon ({mode}, PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon ({mode}) is not running.");
                Ok(())
            }
        }
        Command::Status { mode, config } => {
            if let Some(pid) = is_daemon_running(mode) {
                println!("Daemon ({mode}) is running (PID {pid})");

                let config =
                    DaemonConfig::load(config.as_deref()).context("Failed to load configuration")?;
                if mode != Mode::Relay {
                    println!("Sensors:  {}", config.sensor_addr);
                }
                if mode != Mode::Ingest {
                    println!("Monitors: {}", config.monitor_addr);
                }
                if mode != Mode::All {
                    println!("Handoff:  {}", config.handoff_dir.display());
                }
                println!("Log:      {}", log_file_path(mode).display());

                Ok(())
            } else {
                println!("Daemon ({mode}) is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize(mode: Mode) -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path(mode);

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(mode: Mode, config: DaemonConfig, secrets: ModeSecrets) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("firewatchd=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        mode = %mode,
        "firewatch daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let result = match mode {
        Mode::All => run_all(&config, secrets, cancel_token).await,
        Mode::Ingest => run_ingest(&config, secrets, cancel_token).await,
        Mode::Relay => run_relay_mode(&config, secrets, cancel_token).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "Daemon error");
    }
    info!(mode = %mode, "firewatch daemon stopped");
    result
}

fn required(secret: Option<SecretHash>, key: &str) -> Result<SecretHash> {
    secret.with_context(|| format!("{key} is required in this mode"))
}

fn session_config(config: &DaemonConfig) -> SessionConfig {
    SessionConfig {
        auth_timeout: config.auth_timeout(),
        silence_timeout: config.silence_timeout(),
    }
}

async fn bind_sensor_server(
    config: &DaemonConfig,
    registry: RegistryHandle,
    secret: SecretHash,
    cancel_token: CancellationToken,
) -> Result<SensorServer> {
    let server = SensorServer::bind(config.sensor_addr, registry, secret, cancel_token)
        .await
        .context("Failed to start sensor server")?;
    Ok(server
        .with_session_config(session_config(config))
        .with_max_pending_auth(config.max_pending_auth))
}

async fn run_all(
    config: &DaemonConfig,
    secrets: ModeSecrets,
    cancel_token: CancellationToken,
) -> Result<()> {
    let registry = spawn_registry_with_capacity(config.max_sensors);
    let monitors = Arc::new(MonitorRegistry::with_capacity(
        required(secrets.monitor, ENV_MONITOR_SECRET)?,
        config.max_monitors,
    ));
    info!("Sensor registry started");

    let service = FireAlarmService::new(SensorSource::Live(registry.clone()), Arc::clone(&monitors));
    let sensor_server = bind_sensor_server(
        config,
        registry.clone(),
        required(secrets.sensor, ENV_SENSOR_SECRET)?,
        cancel_token.clone(),
    )
    .await?;
    let monitor_server = MonitorServer::bind(config.monitor_addr, service, cancel_token.clone())
        .await
        .context("Failed to start monitor server")?;

    let relay = tokio::spawn(run_relay(
        RegistryHandoff::new(registry),
        NotificationDispatcher::new(monitors),
        SnapshotMirror::new(),
        cancel_token.clone(),
    ));

    tokio::try_join!(sensor_server.run(), monitor_server.run())?;
    cancel_token.cancel();
    let _ = relay.await;
    Ok(())
}

async fn run_ingest(
    config: &DaemonConfig,
    secrets: ModeSecrets,
    cancel_token: CancellationToken,
) -> Result<()> {
    let registry = spawn_registry_with_capacity(config.max_sensors);
    let writer = FileHandoffWriter::open(&config.handoff_dir, registry.clone())
        .await
        .with_context(|| open_error(&config.handoff_dir))?;
    info!(dir = %config.handoff_dir.display(), "Publishing to handoff directory");

    let sensor_server = bind_sensor_server(
        config,
        registry,
        required(secrets.sensor, ENV_SENSOR_SECRET)?,
        cancel_token.clone(),
    )
    .await?;

    let publisher = tokio::spawn(run_publisher(
        writer,
        config.handoff_poll(),
        cancel_token.clone(),
    ));

    let result = sensor_server.run().await;
    cancel_token.cancel();
    // Let the publisher flush the removals made while sessions closed
    let _ = publisher.await;
    result.map_err(Into::into)
}

async fn run_relay_mode(
    config: &DaemonConfig,
    secrets: ModeSecrets,
    cancel_token: CancellationToken,
) -> Result<()> {
    let monitors = Arc::new(MonitorRegistry::with_capacity(
        required(secrets.monitor, ENV_MONITOR_SECRET)?,
        config.max_monitors,
    ));
    let reader = FileHandoffReader::open(&config.handoff_dir, config.handoff_poll())
        .await
        .with_context(|| open_error(&config.handoff_dir))?;
    info!(dir = %config.handoff_dir.display(), "Relaying from handoff directory");

    let mirror = SnapshotMirror::new();
    let service = FireAlarmService::new(SensorSource::Mirrored(mirror.clone()), Arc::clone(&monitors));
    let monitor_server = MonitorServer::bind(config.monitor_addr, service, cancel_token.clone())
        .await
        .context("Failed to start monitor server")?;

    let relay = tokio::spawn(run_relay(
        reader,
        NotificationDispatcher::new(monitors),
        mirror,
        cancel_token.clone(),
    ));

    let result = monitor_server.run().await;
    cancel_token.cancel();
    let _ = relay.await;
    result.map_err(Into::into)
}

fn open_error(dir: &Path) -> String {
    format!("Failed to open handoff directory {}", dir.display())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
