//! Application configuration
//!
//! Values come from `config/default.toml` (optional) and are overridden by
//! `VEHICLETRACKER__SECTION__KEY` environment variables.

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;

use crate::{
    cache::LOCATION_TTL, errors::TrackerError, geofence::STATE_TTL, mqtt::is_report_filter,
};

const ENV_PREFIX: &str = "VEHICLETRACKER";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub geofence: GeofenceConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MqttTransport {
    #[default]
    Tcp,
    Tls,
    /// MQTT over secure websocket; `host` is then the full `wss://` URL.
    Wss,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topics: Vec<String>,
    pub transport: MqttTransport,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "vehicle-tracker".to_string(),
            topics: vec!["vehicles/+/location".to_string()],
            transport: MqttTransport::Tcp,
            keep_alive: Duration::from_secs(5),
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,
}

fn default_max_connections() -> u32 {
    20
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(2)
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Without a Redis URL an in-process cache is used.
    pub redis_url: Option<String>,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub location_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            location_ttl: LOCATION_TTL,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 256,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeofenceConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub state_ttl: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            state_ttl: STATE_TTL,
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Prefix of outbound MQTT topics, `{prefix}/{channel}`.
    pub topic_prefix: String,
    pub channel_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "tracking".to_string(),
            channel_capacity: 256,
        }
    }
}

fn invalid(message: impl Into<String>) -> TrackerError {
    TrackerError::Configuration {
        message: message.into(),
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::build(File::with_name("config/default").required(false))
    }

    /// Load from an explicit file, still honouring environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Self::build(File::from(path).required(true))
    }

    fn build<S>(file: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("mqtt.topics"),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        self.mqtt.validate()?;
        self.database.validate()?;
        self.cache.validate()?;
        self.ingest.validate()?;
        self.geofence.validate()?;
        self.broadcast.validate()?;
        Ok(())
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.host.trim().is_empty() {
            return Err(invalid("MQTT host cannot be empty"));
        }
        if self.client_id.trim().is_empty() {
            return Err(invalid("MQTT client id cannot be empty"));
        }
        if self.topics.is_empty() {
            return Err(invalid("At least one MQTT topic is required"));
        }
        if let Some(topic) = self.topics.iter().find(|t| !is_report_filter(t)) {
            return Err(invalid(format!(
                "MQTT topic {} does not match vehicles/{{id}}/location",
                topic
            )));
        }
        if self.transport == MqttTransport::Wss && !self.host.starts_with("wss://") {
            return Err(invalid("Websocket transport needs a wss:// host URL"));
        }
        Ok(())
    }
}

impl DatabaseConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), TrackerError> {
        if !(self.url.starts_with("postgres://") || self.url.starts_with("postgresql://")) {
            return Err(invalid("Database URL must be a postgres:// URL"));
        }
        if self.max_connections == 0 {
            return Err(invalid("Database pool needs at least one connection"));
        }
        if self.acquire_timeout.is_zero() {
            return Err(invalid("Acquire timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.location_ttl.is_zero() {
            return Err(invalid("Location cache TTL must be greater than zero"));
        }
        if let Some(url) = &self.redis_url {
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                return Err(invalid("Redis URL must be a redis:// or rediss:// URL"));
            }
        }
        Ok(())
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.workers == 0 || self.queue_capacity == 0 {
            return Err(invalid("Ingest workers and queue capacity must be positive"));
        }
        Ok(())
    }
}

impl GeofenceConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.state_ttl.is_zero() {
            return Err(invalid("Geofence state TTL must be greater than zero"));
        }
        if self.workers == 0 || self.queue_capacity == 0 {
            return Err(invalid("Geofence workers and queue capacity must be positive"));
        }
        Ok(())
    }
}

impl BroadcastConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        let prefix = self.topic_prefix.trim_matches('/');
        if prefix.is_empty() || prefix.contains(['+', '#']) {
            return Err(invalid("Broadcast topic prefix must be a plain MQTT topic"));
        }
        if self.channel_capacity == 0 {
            return Err(invalid("Broadcast channel capacity must be positive"));
        }
        Ok(())
    }
}
