//! Tracking service: ingestion and the query surface.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    alerts::AlertDispatcher,
    broadcast::{FanOut, Publisher},
    cache::{KeyValueCache, LocationCache},
    config::GeofenceConfig,
    database::{AlertStore, GeofenceStore, LocationStore},
    errors::TrackerError,
    geofence::{GeofencePipeline, GeofenceStateTracker, GeofenceWorkers},
    models::{
        Alert, CachedLocation, DailyRoute, GeofenceEvent, HistoryQuery, LocationHistoryRecord,
        LocationReport, NearbyVehicle, Point, UserId, VehicleId, VehicleLocation,
        VehicleSummary, DEFAULT_NEARBY_RADIUS_M,
    },
};

/// Independent reachability of the store and the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub store: bool,
    pub cache: bool,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.store && self.cache
    }
}

pub struct Tracker {
    locations: Arc<dyn LocationStore>,
    geofences: Arc<dyn GeofenceStore>,
    alerts: Arc<dyn AlertStore>,
    cache: LocationCache,
    fanout: Arc<FanOut>,
    workers: GeofenceWorkers,
}

impl Tracker {
    /// Wire the pipeline around `store` and start the geofence workers.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new<S>(
        store: Arc<S>,
        cache: Arc<dyn KeyValueCache>,
        publishers: Vec<Arc<dyn Publisher>>,
        location_ttl: Duration,
        geofence: &GeofenceConfig,
    ) -> Self
    where
        S: LocationStore + GeofenceStore + AlertStore + 'static,
    {
        let fanout = Arc::new(FanOut::new(publishers));
        let dispatcher = AlertDispatcher::new(store.clone(), fanout.clone());
        let pipeline = GeofencePipeline::new(
            store.clone(),
            GeofenceStateTracker::new(cache.clone(), geofence.state_ttl),
            dispatcher,
        );

        Self {
            locations: store.clone(),
            geofences: store.clone(),
            alerts: store.clone(),
            cache: LocationCache::new(cache, store, location_ttl),
            fanout,
            workers: GeofenceWorkers::spawn(Arc::new(pipeline), geofence),
        }
    }

    /// Validate and store a report, then fan it out and queue geofence
    /// evaluation.
    ///
    /// Only validation and store failures are returned. Cache, broadcast
    /// and geofence problems are logged.
    pub async fn ingest(&self, report: LocationReport) -> Result<VehicleLocation, TrackerError> {
        let update = report.validate(Utc::now())?;
        let location = self.locations.upsert(&update).await?;
        debug!(
            "Stored location for vehicle {} at ({}, {})",
            location.vehicle_id, location.latitude, location.longitude
        );

        self.cache.put(&location).await;
        self.fanout.publish_location(&location).await;
        self.workers.submit(location.clone());

        Ok(location)
    }

    /// Current location with its provenance.
    pub async fn current_location(&self, vehicle_id: &str) -> Result<CachedLocation, TrackerError> {
        let vehicle_id = VehicleId::try_from(vehicle_id)?;
        self.cache.get(&vehicle_id).await
    }

    /// Active vehicles among `ids`; blank, unknown and inactive ids are left out.
    pub async fn locations<I>(&self, ids: I) -> Result<Vec<VehicleSummary>, TrackerError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let ids: Vec<VehicleId> = ids
            .into_iter()
            .filter_map(|id| VehicleId::try_from(id.as_ref()).ok())
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.locations.get_many(&ids).await
    }

    pub async fn history(
        &self,
        vehicle_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<LocationHistoryRecord>, TrackerError> {
        let vehicle_id = VehicleId::try_from(vehicle_id)?;
        self.locations.get_history(&vehicle_id, &query).await
    }

    /// Vehicles near a point, 5 km when no radius is given.
    pub async fn nearby(
        &self,
        latitude: f64,
        longitude: f64,
        radius_m: Option<f64>,
    ) -> Result<Vec<NearbyVehicle>, TrackerError> {
        let point = Point::new(latitude, longitude)?;
        self.locations
            .get_nearby(point, radius_m.unwrap_or(DEFAULT_NEARBY_RADIUS_M))
            .await
    }

    pub async fn route(
        &self,
        vehicle_id: &str,
        date: NaiveDate,
    ) -> Result<DailyRoute, TrackerError> {
        let vehicle_id = VehicleId::try_from(vehicle_id)?;
        self.locations.get_route(&vehicle_id, date).await
    }

    pub async fn recent_alerts(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<Alert>, TrackerError> {
        self.alerts.recent_alerts(user_id, limit).await
    }

    pub async fn recent_geofence_events(
        &self,
        vehicle_id: &str,
        limit: u32,
    ) -> Result<Vec<GeofenceEvent>, TrackerError> {
        let vehicle_id = VehicleId::try_from(vehicle_id)?;
        self.geofences
            .recent_geofence_events(&vehicle_id, limit)
            .await
    }

    pub async fn health(&self) -> HealthStatus {
        let store = match self.locations.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Store health check failed: {}", e);
                false
            }
        };
        let cache = match self.cache.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Cache health check failed: {}", e);
                false
            }
        };
        HealthStatus { store, cache }
    }

    /// Stop the geofence workers after draining queued evaluations.
    pub async fn shutdown(self) {
        self.workers.shutdown().await;
    }
}
