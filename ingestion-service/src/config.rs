use serde::Deserialize;
use std::{fs, time::Duration};
use time::UtcOffset;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    /// Pool size for the HTTP API. Ingestion workers hold their own connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default)]
    pub apply_schema: bool,
}

impl DatabaseConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub topic: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_mqtt_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_sink_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            channel_capacity: default_sink_channel_capacity(),
        }
    }
}

/// Values substituted when a message (or API call) leaves them out.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_liters")]
    pub liters: f64,
    /// Offset from UTC that defines the calendar day used as "today".
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            liters: default_liters(),
            utc_offset_minutes: 0,
        }
    }
}

impl DefaultsConfig {
    pub fn utc_offset(&self) -> Result<UtcOffset, ConfigError> {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes.saturating_mul(60))
            .map_err(|e| ConfigError::Invalid(format!("defaults.utc_offset_minutes: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    pub api: Option<ApiConfig>,
    pub metrics: Option<MetricsConfig>,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        use std::env;

        let path = env::var("WATER_INGEST_CONFIG").unwrap_or_else(|_| "water-ingest.toml".to_string());
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.topic must not be empty".to_string()));
        }
        if !self.defaults.liters.is_finite() || self.defaults.liters < 0.0 {
            return Err(ConfigError::Invalid(
                "defaults.liters must be a non-negative number".to_string(),
            ));
        }
        if self.sink.workers == 0 {
            return Err(ConfigError::Invalid("sink.workers must be at least 1".to_string()));
        }
        if self.defaults.utc_offset_minutes.abs() > MAX_OFFSET_MINUTES {
            return Err(ConfigError::Invalid(
                "defaults.utc_offset_minutes must be within +/-23:59".to_string(),
            ));
        }
        self.defaults.utc_offset()?;
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

const MAX_OFFSET_MINUTES: i32 = 23 * 60 + 59;

fn default_max_connections() -> u32 {
    4
}

fn default_operation_timeout_ms() -> u64 {
    5_000
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "water-ingest".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_mqtt_channel_capacity() -> usize {
    1024
}

fn default_reconnect_backoff_ms() -> u64 {
    1_000
}

fn default_workers() -> usize {
    1
}

fn default_sink_channel_capacity() -> usize {
    256
}

fn default_device_id() -> String {
    "1".to_string()
}

fn default_liters() -> f64 {
    0.16
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}
