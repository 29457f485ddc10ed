// Configuration loading - Layered defaults, config file and environment
use crate::infrastructure::snapshot_repository::DEFAULT_COMPACT_AFTER;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct PowerConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    pub scheduler: SchedulerSettings,
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub devices: Vec<DeviceEndpoint>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub bind_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Durable snapshot file. Without it the store lives in memory only.
    pub snapshot_path: Option<PathBuf>,
    /// Journal entries written before they are folded into a new snapshot.
    #[serde(default = "default_compact_after")]
    pub compact_after_entries: usize,
}

fn default_compact_after() -> usize {
    DEFAULT_COMPACT_AFTER
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            compact_after_entries: DEFAULT_COMPACT_AFTER,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerSettings {
    pub poll_interval_secs: u64,
    pub status_threshold_watts: f64,
}

impl SchedulerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub request_timeout_secs: u64,
    pub mains_voltage: f64,
}

impl TelemetrySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeviceEndpoint {
    pub id: String,
    pub url: String,
}

fn builder_with_defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    config::Config::builder()
        .set_default("server.bind_addr", "0.0.0.0:8080")?
        .set_default("scheduler.poll_interval_secs", 5)?
        .set_default("scheduler.status_threshold_watts", 0.0)?
        .set_default("telemetry.enabled", true)?
        .set_default("telemetry.request_timeout_secs", 5)?
        .set_default("telemetry.mains_voltage", 230.0)
}

/// Defaults, then `config/power.*` if present, then `POWER__SECTION__KEY` variables.
pub fn load_power_config() -> anyhow::Result<PowerConfig> {
    let settings = builder_with_defaults()?
        .add_source(config::File::with_name("config/power").required(false))
        .add_source(config::Environment::with_prefix("POWER").separator("__"))
        .build()?;

    Ok(settings.try_deserialize()?)
}
