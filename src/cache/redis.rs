use std::time::Duration;

use ::redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use async_trait::async_trait;
use tracing::info;

use super::KeyValueCache;
use crate::errors::TrackerError;

/// Redis backed cache over a multiplexed connection.
#[derive(Clone)]
pub struct RedisCache {
    connection: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        let client = Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!("Redis cache connected");
        Ok(Self { connection })
    }
}

#[async_trait]
impl KeyValueCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, TrackerError> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), TrackerError> {
        let mut connection = self.connection.clone();
        let () = connection.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TrackerError> {
        let mut connection = self.connection.clone();
        let () = connection.del(key).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), TrackerError> {
        let mut connection = self.connection.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }
}
