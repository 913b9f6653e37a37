//! TTL key-value cache and the current-location cache built on it.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    database::LocationStore,
    errors::TrackerError,
    models::{CachedLocation, LocationSource, VehicleId, VehicleLocation},
};

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// Default lifetime of a cached current location.
pub const LOCATION_TTL: Duration = Duration::from_secs(300);

/// String key-value store with per-entry expiry.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, TrackerError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), TrackerError>;

    async fn delete(&self, key: &str) -> Result<(), TrackerError>;

    async fn ping(&self) -> Result<(), TrackerError>;
}

pub(crate) fn location_key(vehicle_id: &VehicleId) -> String {
    format!("vehicle:location:{}", vehicle_id)
}

/// Read-through, write-through cache of current locations.
///
/// The cache is advisory. Any cache failure is logged and the store is used
/// directly; only store failures reach the caller.
#[derive(Clone)]
pub struct LocationCache {
    cache: Arc<dyn KeyValueCache>,
    store: Arc<dyn LocationStore>,
    ttl: Duration,
}

impl LocationCache {
    pub fn new(
        cache: Arc<dyn KeyValueCache>,
        store: Arc<dyn LocationStore>,
        ttl: Duration,
    ) -> Self {
        Self { cache, store, ttl }
    }

    /// Current location, from the cache when present, otherwise from the store.
    pub async fn get(&self, vehicle_id: &VehicleId) -> Result<CachedLocation, TrackerError> {
        let key = location_key(vehicle_id);

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<VehicleLocation>(&raw) {
                Ok(location) => {
                    debug!("Location cache hit for vehicle {}", vehicle_id);
                    return Ok(CachedLocation {
                        location,
                        source: LocationSource::Cache,
                    });
                }
                Err(e) => warn!("Discarding unreadable cache entry {}: {}", key, e),
            },
            Ok(None) => debug!("Location cache miss for vehicle {}", vehicle_id),
            Err(e) => warn!("Location cache read failed, using store: {}", e),
        }

        let location = self.store.get_location(vehicle_id).await?;
        self.put(&location).await;

        Ok(CachedLocation {
            location,
            source: LocationSource::Store,
        })
    }

    /// Overwrite the cached entry. Last writer wins.
    pub async fn put(&self, location: &VehicleLocation) {
        let key = location_key(&location.vehicle_id);

        let payload = match serde_json::to_string(location) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode location for cache: {}", e);
                return;
            }
        };

        if let Err(e) = self.cache.set_ex(&key, &payload, self.ttl).await {
            warn!("Location cache write failed for {}: {}", key, e);
        }
    }

    pub async fn ping(&self) -> Result<(), TrackerError> {
        self.cache.ping().await
    }
}
