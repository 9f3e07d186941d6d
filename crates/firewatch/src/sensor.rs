//! Sensor simulator.
//!
//! Stands in for a field device: authenticates with the shared sensor
//! secret, then reports randomized readings on a fixed interval.

use std::net::SocketAddr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use firewatch_core::{ReadingValues, SensorId};
use firewatch_protocol::{SensorMessage, SensorReply};

/// Default daemon sensor address.
pub const DEFAULT_SENSOR_ADDR: &str = "127.0.0.1:9001";

const AUTH_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub addr: SocketAddr,
    /// Shared sensor secret
    pub token: String,
    pub sensor_id: SensorId,
    /// Time between readings
    pub interval: Duration,
    /// Stop after this many readings; `None` runs until cancelled
    pub count: Option<u64>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 9001)),
            token: String::new(),
            sensor_id: SensorId::new("1-1"),
            interval: Duration::from_secs(5),
            count: None,
        }
    }
}

/// Draws one plausible reading.
///
/// Temperature 20-81 C at two decimals, battery 1-100, smoke 1-10; CO2
/// sits at the healthy 300 ppm most of the time and otherwise drifts
/// between 280 and 320.
pub fn random_values<R: Rng + ?Sized>(rng: &mut R) -> ReadingValues {
    let temperature = (rng.gen_range(20.0..81.0_f64) * 100.0).round() / 100.0;
    let battery = rng.gen_range(1..=100);
    let smoke = rng.gen_range(1..=10);
    let co2 = if rng.gen_bool(0.8) {
        300.0
    } else {
        f64::from(rng.gen_range(280..=320_i32))
    };
    ReadingValues::new(temperature, battery, smoke, co2)
}

/// A simulated sensor connection.
pub struct SensorSimulator {
    config: SensorConfig,
    rng: StdRng,
    cancel_token: CancellationToken,
}

impl SensorSimulator {
    pub fn new(config: SensorConfig, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            rng: StdRng::from_entropy(),
            cancel_token,
        }
    }

    /// Uses a fixed seed so runs are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Connects, authenticates and reports until cancelled or `count` is
    /// reached. Returns the number of readings sent.
    pub async fn run(&mut self) -> Result<u64> {
        let stream = TcpStream::connect(self.config.addr)
            .await
            .map_err(|e| ClientError::Connection(format!("{}: {e}", self.config.addr)))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        send(&mut writer, &SensorMessage::authenticate(self.config.token.clone())).await?;

        let mut line = String::new();
        let read = timeout(AUTH_REPLY_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| ClientError::Connection("no reply to authenticate".to_string()))??;
        if read == 0 {
            return Err(ClientError::Closed);
        }
        match serde_json::from_str::<SensorReply>(line.trim())? {
            SensorReply::Authenticated { .. } => {
                info!(sensor_id = %self.config.sensor_id, "Sensor authenticated");
            }
            SensorReply::Rejected { reason, .. } => return Err(ClientError::Rejected(reason)),
        }

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent = 0u64;

        loop {
            if self.config.count.is_some_and(|max| sent >= max) {
                break;
            }

            line.clear();
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                read = reader.read_line(&mut line) => {
                    if read? == 0 {
                        return Err(ClientError::Closed);
                    }
                    debug!(line = %line.trim(), "Unexpected message from daemon");
                }
                _ = ticker.tick() => {
                    let values = random_values(&mut self.rng);
                    send(&mut writer, &SensorMessage::reading(&self.config.sensor_id, &values)).await?;
                    sent += 1;
                    debug!(
                        sensor_id = %self.config.sensor_id,
                        temperature = values.temperature_c,
                        battery = values.battery_pct,
                        smoke = values.smoke_level,
                        co2 = values.co2_ppm,
                        "Reading sent"
                    );
                }
            }
        }

        let _ = writer.shutdown().await;
        info!(sensor_id = %self.config.sensor_id, sent, "Sensor stopped");
        Ok(sent)
    }
}

async fn send<W: AsyncWriteExt + Unpin>(writer: &mut W, message: &SensorMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
