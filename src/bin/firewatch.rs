//! firewatch - console tools for the fire alarm daemon
//!
//! # Usage
//!
//! ```text
//! firewatch watch                  # register as a monitor and print pushes
//! firewatch query sensors          # one-shot queries, no secret needed
//! firewatch query readings
//! firewatch sensor --id 2-14       # run a simulated sensor
//! ```
//!
//! `watch` reads the secret from `FIREWATCH_MONITOR_SECRET` when `--secret`
//! is omitted; `sensor` does the same with `FIREWATCH_SENSOR_SECRET`.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use firewatch_client::client::{self, DEFAULT_MONITOR_ADDR};
use firewatch_client::sensor::DEFAULT_SENSOR_ADDR;
use firewatch_client::{
    MonitorClient, MonitorConfig, MonitorUpdate, SensorConfig, SensorSimulator,
};
use firewatch_core::SensorId;

const ENV_MONITOR_SECRET: &str = "FIREWATCH_MONITOR_SECRET";
const ENV_SENSOR_SECRET: &str = "FIREWATCH_SENSOR_SECRET";

/// firewatch - watch, query and simulate fire sensors
#[derive(Parser, Debug)]
#[command(name = "firewatch", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register as a monitor and print every reading, alert and count change
    Watch {
        /// Daemon monitor address
        #[arg(long, default_value = DEFAULT_MONITOR_ADDR)]
        addr: SocketAddr,

        /// Monitor secret (defaults to $FIREWATCH_MONITOR_SECRET)
        #[arg(long)]
        secret: Option<String>,
    },
    /// Ask the daemon a single question and exit
    Query {
        #[arg(value_enum)]
        what: QueryKind,

        /// Daemon monitor address
        #[arg(long, default_value = DEFAULT_MONITOR_ADDR)]
        addr: SocketAddr,
    },
    /// Run a simulated sensor that reports random readings
    Sensor {
        /// Sensor identifier, conventionally floor-room
        #[arg(long, default_value = "1-1")]
        id: String,

        /// Daemon sensor address
        #[arg(long, default_value = DEFAULT_SENSOR_ADDR)]
        addr: SocketAddr,

        /// Sensor secret (defaults to $FIREWATCH_SENSOR_SECRET)
        #[arg(long)]
        token: Option<String>,

        /// Seconds between readings
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,

        /// Stop after this many readings
        #[arg(long)]
        count: Option<u64>,

        /// Seed the value generator for a reproducible run
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum QueryKind {
    /// Number of connected sensors
    Sensors,
    /// Number of registered monitors
    Monitors,
    /// Every sensor's latest reading
    Readings,
}

fn secret_or_env(value: Option<String>, key: &str) -> Result<String> {
    match value {
        Some(secret) => Ok(secret),
        None => std::env::var(key).with_context(|| format!("pass the secret or set {key}")),
    }
}

fn setup_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("firewatch_client=warn".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging()?;

    match args.command {
        Command::Watch { addr, secret } => {
            let secret = secret_or_env(secret, ENV_MONITOR_SECRET)?;
            watch(addr, secret).await
        }
        Command::Query { what, addr } => query(what, addr).await,
        Command::Sensor {
            id,
            addr,
            token,
            interval_secs,
            count,
            seed,
        } => {
            let config = SensorConfig {
                addr,
                token: secret_or_env(token, ENV_SENSOR_SECRET)?,
                sensor_id: SensorId::new(id),
                interval: Duration::from_secs(interval_secs),
                count,
            };
            simulate(config, seed).await
        }
    }
}

async fn watch(addr: SocketAddr, secret: String) -> Result<()> {
    let cancel_token = cancel_on_ctrl_c();
    let (update_tx, mut update_rx) = mpsc::unbounded_channel();

    let monitor = MonitorClient::new(
        MonitorConfig {
            addr,
            secret,
            ..MonitorConfig::default()
        },
        update_tx,
        cancel_token.clone(),
    );
    let client_task = tokio::spawn(async move { monitor.run().await });

    while let Some(update) = update_rx.recv().await {
        match update {
            MonitorUpdate::Registered { monitor_id } => {
                println!("Registered as monitor {monitor_id}");
            }
            MonitorUpdate::Data(text) => println!("{text}"),
            MonitorUpdate::SensorCountChanged(count) => println!("Sensors connected: {count}"),
            MonitorUpdate::MonitorCountChanged(count) => println!("Monitors connected: {count}"),
            MonitorUpdate::Disconnected => eprintln!("Disconnected from daemon, reconnecting..."),
        }
    }

    client_task
        .await
        .context("Monitor client task failed")?
        .context("Monitor client stopped")
}

async fn query(what: QueryKind, addr: SocketAddr) -> Result<()> {
    match what {
        QueryKind::Sensors => println!("{}", client::sensor_count(addr).await?),
        QueryKind::Monitors => println!("{}", client::monitor_count(addr).await?),
        QueryKind::Readings => {
            let text = client::all_readings(addr).await?;
            if text.is_empty() {
                println!("No sensors connected.");
            } else {
                println!("{text}");
            }
        }
    }
    Ok(())
}

async fn simulate(config: SensorConfig, seed: Option<u64>) -> Result<()> {
    let cancel_token = cancel_on_ctrl_c();
    let sensor_id = config.sensor_id.clone();

    let mut simulator = SensorSimulator::new(config, cancel_token);
    if let Some(seed) = seed {
        simulator = simulator.with_seed(seed);
    }

    let sent = simulator
        .run()
        .await
        .with_context(|| format!("Sensor {sensor_id} failed"))?;
    info!(sensor_id = %sensor_id, sent, "Simulation finished");
    println!("Sensor {sensor_id} sent {sent} readings");
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel_token
}
