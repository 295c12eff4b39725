use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sdk: SdkConfig,
    pub audio: AudioConfig,
    pub websocket: WebSocketConfig,
    pub bus: BusConfig,
    pub workers: WorkersConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

/// Credentials handed to the native meeting SDK.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SdkConfig {
    pub key: String,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Capacity of the per-meeting queue fed by the SDK audio callback
    pub intake_queue_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub write_timeout_secs: u64,
    /// Inactivity deadline, extended by any inbound traffic (pongs included)
    pub read_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub flush_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub queue_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub subscriber_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerMode {
    /// One worker process per meeting
    Process,
    /// Meetings run inside the server process
    InProcess,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub mode: ManagerMode,
    pub bind_host: String,
    pub base_port: u16,
    /// Exclusive upper bound of the worker port range
    pub max_port: u16,
    pub ready_timeout_ms: u64,
    pub ready_poll_interval_ms: u64,
    pub relay_start_delay_ms: u64,
    pub stop_grace_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub worker_binary: Option<String>,
    pub callback_url: Option<String>,
}

/// Parameters of the simulated SDK used when no native SDK is linked.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub speakers: Vec<u64>,
    pub frame_ms: u64,
    pub tone_hz: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 32000,
            channels: 1,
            intake_queue_size: 1000,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            write_timeout_secs: 5,
            read_timeout_secs: 180,
            ping_interval_secs: 60,
            flush_interval_ms: 100,
            heartbeat_interval_secs: 30,
            queue_size: 1000,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_timeout_secs: 600,
            cleanup_interval_secs: 60,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            mode: ManagerMode::Process,
            bind_host: "127.0.0.1".to_string(),
            base_port: 9000,
            max_port: 9999,
            ready_timeout_ms: 10_000,
            ready_poll_interval_ms: 200,
            relay_start_delay_ms: 1000,
            stop_grace_secs: 5,
            shutdown_timeout_secs: 10,
            worker_binary: None,
            callback_url: None,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            speakers: vec![1001, 1002],
            frame_ms: 20,
            tone_hz: 440.0,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    pub fn load_from(config_name: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_name).required(false))
            .add_source(
                config::Environment::with_prefix("MEETING_AUDIO")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("simulation.speakers")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Checks what the server cannot run without. Missing SDK credentials are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.sdk.key.trim().is_empty() {
            return Err(Error::MissingCredentials(
                "SDK key is required (set MEETING_AUDIO__SDK__KEY)".to_string(),
            ));
        }
        if self.sdk.secret.trim().is_empty() {
            return Err(Error::MissingCredentials(
                "SDK secret is required (set MEETING_AUDIO__SDK__SECRET)".to_string(),
            ));
        }
        if self.workers.max_port <= self.workers.base_port {
            return Err(Error::Internal(format!(
                "Invalid worker port range {}-{}",
                self.workers.base_port, self.workers.max_port
            )));
        }
        Ok(())
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.http_port)
            .parse()
            .map_err(|e| Error::Internal(format!("Invalid HTTP address: {}", e)))
    }
}

impl WebSocketConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl BusConfig {
    pub fn subscriber_timeout(&self) -> Duration {
        Duration::from_secs(self.subscriber_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl WorkersConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn relay_start_delay(&self) -> Duration {
        Duration::from_millis(self.relay_start_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
