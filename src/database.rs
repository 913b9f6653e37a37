// src/database.rs
//! Persistence for current locations, history, geofences, events and alerts.
//!
//! The tracker talks to storage through three traits so that the
//! PostgreSQL/PostGIS backend ([`Database`]) and the in-process backend
//! ([`MemoryStore`]) are interchangeable.

mod memory;
mod models;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tracing::error;

use crate::{
    errors::TrackerError,
    models::{
        Alert, DailyRoute, Geofence, GeofenceEvent, GeofenceEventKind, HistoryQuery,
        LocationHistoryRecord, LocationUpdate, NearbyVehicle, NewAlert, Point, UserId,
        VehicleId, VehicleLocation, VehicleSummary,
    },
};

pub use memory::MemoryStore;
pub use postgres::Database;

/// Current-location row and append-only history per vehicle.
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Replace the current-location row for the vehicle, returning the stored row.
    async fn upsert_location(&self, update: &LocationUpdate)
        -> Result<VehicleLocation, TrackerError>;

    /// Append an immutable history record.
    async fn append_history(
        &self,
        update: &LocationUpdate,
    ) -> Result<LocationHistoryRecord, TrackerError>;

    /// Current location, or [`TrackerError::NotFound`].
    async fn get_location(&self, vehicle_id: &VehicleId) -> Result<VehicleLocation, TrackerError>;

    /// Active registered vehicles among `ids`, joined with their locations.
    /// Unknown and inactive ids are omitted.
    async fn get_many(&self, ids: &[VehicleId]) -> Result<Vec<VehicleSummary>, TrackerError>;

    /// History newest first, bounded by the query range and clamped limit.
    async fn get_history(
        &self,
        vehicle_id: &VehicleId,
        query: &HistoryQuery,
    ) -> Result<Vec<LocationHistoryRecord>, TrackerError>;

    /// Active vehicles within `radius_m` meters, nearest first, at most
    /// [`MAX_NEARBY_RESULTS`](crate::models::MAX_NEARBY_RESULTS).
    async fn get_nearby(
        &self,
        point: Point,
        radius_m: f64,
    ) -> Result<Vec<NearbyVehicle>, TrackerError>;

    /// History points recorded on one UTC day, oldest first.
    async fn get_route(
        &self,
        vehicle_id: &VehicleId,
        date: NaiveDate,
    ) -> Result<DailyRoute, TrackerError>;

    async fn health_check(&self) -> Result<(), TrackerError>;

    /// Write the current location, then append history.
    ///
    /// History is best-effort: a failed append is logged and the stored
    /// current location is still returned.
    async fn upsert(&self, update: &LocationUpdate) -> Result<VehicleLocation, TrackerError> {
        let location = self.upsert_location(update).await?;

        if let Err(e) = self.append_history(update).await {
            error!(
                "Failed to append history for vehicle {}: {}",
                update.vehicle_id, e
            );
        }

        Ok(location)
    }
}

/// Geofence definitions and the transition log.
#[async_trait]
pub trait GeofenceStore: Send + Sync {
    async fn active_geofences(&self) -> Result<Vec<Geofence>, TrackerError>;

    async fn record_geofence_event(
        &self,
        vehicle_id: &VehicleId,
        geofence_id: &str,
        kind: GeofenceEventKind,
        position: Point,
    ) -> Result<GeofenceEvent, TrackerError>;

    /// Events for a vehicle, newest first.
    async fn recent_geofence_events(
        &self,
        vehicle_id: &VehicleId,
        limit: u32,
    ) -> Result<Vec<GeofenceEvent>, TrackerError>;
}

/// Owner lookup and alert persistence.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Owning user of a vehicle, if the vehicle is registered and owned.
    async fn owner_of(&self, vehicle_id: &VehicleId) -> Result<Option<UserId>, TrackerError>;

    async fn insert_alert(
        &self,
        user_id: &UserId,
        vehicle_id: &VehicleId,
        alert: &NewAlert,
    ) -> Result<Alert, TrackerError>;

    /// Alerts for a user, newest first.
    async fn recent_alerts(&self, user_id: &UserId, limit: u32) -> Result<Vec<Alert>, TrackerError>;
}

pub(crate) fn check_radius(radius_m: f64) -> Result<(), TrackerError> {
    if !radius_m.is_finite() || radius_m <= 0.0 {
        return Err(TrackerError::Validation(format!(
            "radius {} must be a positive number of meters",
            radius_m
        )));
    }
    Ok(())
}

/// `[start, end)` of a UTC calendar day.
pub(crate) fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN));
    (start, start + chrono::Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LocationReport;

    /// Memory store whose history table rejects every append.
    struct BrokenHistory(MemoryStore);

    #[async_trait]
    impl LocationStore for BrokenHistory {
        async fn upsert_location(
            &self,
            update: &LocationUpdate,
        ) -> Result<VehicleLocation, TrackerError> {
            self.0.upsert_location(update).await
        }

        async fn append_history(
            &self,
            _update: &LocationUpdate,
        ) -> Result<LocationHistoryRecord, TrackerError> {
            Err(TrackerError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn get_location(
            &self,
            vehicle_id: &VehicleId,
        ) -> Result<VehicleLocation, TrackerError> {
            self.0.get_location(vehicle_id).await
        }

        async fn get_many(&self, ids: &[VehicleId]) -> Result<Vec<VehicleSummary>, TrackerError> {
            self.0.get_many(ids).await
        }

        async fn get_history(
            &self,
            vehicle_id: &VehicleId,
            query: &HistoryQuery,
        ) -> Result<Vec<LocationHistoryRecord>, TrackerError> {
            self.0.get_history(vehicle_id, query).await
        }

        async fn get_nearby(
            &self,
            point: Point,
            radius_m: f64,
        ) -> Result<Vec<NearbyVehicle>, TrackerError> {
            self.0.get_nearby(point, radius_m).await
        }

        async fn get_route(
            &self,
            vehicle_id: &VehicleId,
            date: NaiveDate,
        ) -> Result<DailyRoute, TrackerError> {
            self.0.get_route(vehicle_id, date).await
        }

        async fn health_check(&self) -> Result<(), TrackerError> {
            self.0.health_check().await
        }
    }

    #[tokio::test]
    async fn test_upsert_survives_history_failure() {
        let store = BrokenHistory(MemoryStore::new());
        let update = LocationReport {
            vehicle_id: Some("V1".to_string()),
            latitude: Some(37.5665),
            longitude: Some(126.978),
            ..LocationReport::default()
        }
        .validate(Utc::now())
        .unwrap();

        let stored = store.upsert(&update).await.unwrap();
        assert_eq!(stored.vehicle_id.as_str(), "V1");
        assert_eq!(stored.latitude, 37.5665);

        let current = store.get_location(&update.vehicle_id).await.unwrap();
        assert_eq!(current, stored);

        let history = store
            .get_history(&update.vehicle_id, &HistoryQuery::default())
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn test_check_radius() {
        assert!(check_radius(100.0).is_ok());
        assert!(check_radius(0.0).is_err());
        assert!(check_radius(-5.0).is_err());
        assert!(check_radius(f64::INFINITY).is_err());
    }

    #[test]
    fn test_day_bounds() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let (start, end) = day_bounds(date);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }
}
