//! Errors for the vehicle tracker
use thiserror::Error;

use crate::models::VehicleId;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("No location recorded for vehicle {0}")]
    NotFound(VehicleId),

    #[error("Cache unavailable: {0}")]
    Cache(String),

    #[error("Redis error")]
    Redis(#[from] redis::RedisError),

    #[error("Broadcast failed: {0}")]
    Broadcast(String),

    #[error("MQTT client error")]
    MqttClient(#[from] rumqttc::ClientError),

    #[error("Database error")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("Configuration error")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid topic")]
    InvalidTopic(String),

    #[error("IO error")]
    Io(#[from] std::io::Error),
}

impl TrackerError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Cache and fan-out failures, which callers log and swallow.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Cache(_) | Self::Redis(_) | Self::Broadcast(_) | Self::MqttClient(_)
        )
    }

    /// Failures of the authoritative store, the only ones that fail ingestion.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Migration(_))
    }
}
