// src/database/memory.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::RwLock;

use super::{check_radius, day_bounds, AlertStore, GeofenceStore, LocationStore};
use crate::{
    errors::TrackerError,
    geo,
    models::{
        Alert, DailyRoute, Geofence, GeofenceEvent, GeofenceEventKind, HistoryQuery,
        LocationHistoryRecord, LocationUpdate, NearbyVehicle, NewAlert, Point, RoutePoint,
        UserId, VehicleId, VehicleLocation, VehicleProfile, VehicleSummary, MAX_HISTORY_LIMIT,
        MAX_NEARBY_RESULTS,
    },
};

#[derive(Default)]
struct MemoryState {
    vehicles: HashMap<VehicleId, VehicleProfile>,
    locations: HashMap<VehicleId, VehicleLocation>,
    history: Vec<LocationHistoryRecord>,
    geofences: Vec<Geofence>,
    events: Vec<GeofenceEvent>,
    alerts: Vec<Alert>,
    last_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn active_vehicle(&self, id: &VehicleId) -> Option<&VehicleProfile> {
        self.vehicles.get(id).filter(|vehicle| vehicle.active)
    }
}

/// In-process store with the same semantics as [`Database`](super::Database).
///
/// Distances use the haversine formula instead of the PostGIS spheroid, so
/// proximity results can differ from PostgreSQL by a fraction of a percent.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a vehicle registry entry.
    pub async fn register_vehicle(&self, profile: VehicleProfile) {
        let mut state = self.state.write().await;
        state.vehicles.insert(profile.id.clone(), profile);
    }

    /// Add or replace a geofence definition.
    pub async fn add_geofence(&self, geofence: Geofence) {
        let mut state = self.state.write().await;
        state.geofences.retain(|existing| existing.id != geofence.id);
        state.geofences.push(geofence);
    }
}

#[async_trait]
impl LocationStore for MemoryStore {
    async fn upsert_location(
        &self,
        update: &LocationUpdate,
    ) -> Result<VehicleLocation, TrackerError> {
        let location = VehicleLocation {
            vehicle_id: update.vehicle_id.clone(),
            latitude: update.position.latitude,
            longitude: update.position.longitude,
            altitude: update.telemetry.altitude,
            speed: update.telemetry.speed,
            heading: update.telemetry.heading,
            accuracy: update.telemetry.accuracy,
            timestamp: update.timestamp,
            updated_at: Utc::now(),
        };

        let mut state = self.state.write().await;
        state
            .locations
            .insert(location.vehicle_id.clone(), location.clone());
        Ok(location)
    }

    async fn append_history(
        &self,
        update: &LocationUpdate,
    ) -> Result<LocationHistoryRecord, TrackerError> {
        let mut state = self.state.write().await;
        let record = LocationHistoryRecord {
            id: state.next_id(),
            vehicle_id: update.vehicle_id.clone(),
            latitude: update.position.latitude,
            longitude: update.position.longitude,
            altitude: update.telemetry.altitude,
            speed: update.telemetry.speed,
            heading: update.telemetry.heading,
            accuracy: update.telemetry.accuracy,
            battery_level: update.telemetry.battery_level,
            is_charging: update.telemetry.is_charging,
            recorded_at: update.timestamp,
        };
        state.history.push(record.clone());
        Ok(record)
    }

    async fn get_location(&self, vehicle_id: &VehicleId) -> Result<VehicleLocation, TrackerError> {
        let state = self.state.read().await;
        state
            .locations
            .get(vehicle_id)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(vehicle_id.clone()))
    }

    async fn get_many(&self, ids: &[VehicleId]) -> Result<Vec<VehicleSummary>, TrackerError> {
        let state = self.state.read().await;

        let mut summaries: Vec<VehicleSummary> = ids
            .iter()
            .filter_map(|id| state.active_vehicle(id))
            .map(|vehicle| {
                let location = state.locations.get(&vehicle.id);
                VehicleSummary {
                    vehicle_id: vehicle.id.clone(),
                    vehicle_number: vehicle.vehicle_number.clone(),
                    model: vehicle.model.clone(),
                    latitude: location.map(|l| l.latitude),
                    longitude: location.map(|l| l.longitude),
                    speed: location.and_then(|l| l.speed),
                    heading: location.and_then(|l| l.heading),
                    timestamp: location.map(|l| l.timestamp),
                }
            })
            .collect();

        summaries.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        summaries.dedup_by(|a, b| a.vehicle_id == b.vehicle_id);
        Ok(summaries)
    }

    async fn get_history(
        &self,
        vehicle_id: &VehicleId,
        query: &HistoryQuery,
    ) -> Result<Vec<LocationHistoryRecord>, TrackerError> {
        query.validate()?;

        let state = self.state.read().await;
        let mut records: Vec<LocationHistoryRecord> = state
            .history
            .iter()
            .filter(|r| &r.vehicle_id == vehicle_id && query.contains(r.recorded_at))
            .cloned()
            .collect();

        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at).then(b.id.cmp(&a.id)));
        records.truncate(query.effective_limit() as usize);
        Ok(records)
    }

    async fn get_nearby(
        &self,
        point: Point,
        radius_m: f64,
    ) -> Result<Vec<NearbyVehicle>, TrackerError> {
        check_radius(radius_m)?;

        let state = self.state.read().await;
        let mut nearby: Vec<NearbyVehicle> = state
            .locations
            .values()
            .filter_map(|location| {
                let vehicle = state.active_vehicle(&location.vehicle_id)?;
                let distance_m = geo::distance_m(point, location.position());
                (distance_m <= radius_m).then(|| NearbyVehicle {
                    vehicle_id: vehicle.id.clone(),
                    vehicle_number: vehicle.vehicle_number.clone(),
                    model: vehicle.model.clone(),
                    latitude: location.latitude,
                    longitude: location.longitude,
                    speed: location.speed,
                    distance_m,
                })
            })
            .collect();

        nearby.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
        nearby.truncate(MAX_NEARBY_RESULTS as usize);
        Ok(nearby)
    }

    async fn get_route(
        &self,
        vehicle_id: &VehicleId,
        date: NaiveDate,
    ) -> Result<DailyRoute, TrackerError> {
        let (start, end) = day_bounds(date);

        let state = self.state.read().await;
        let mut records: Vec<&LocationHistoryRecord> = state
            .history
            .iter()
            .filter(|r| {
                &r.vehicle_id == vehicle_id && r.recorded_at >= start && r.recorded_at < end
            })
            .collect();
        records.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.id.cmp(&b.id)));

        let points = records
            .into_iter()
            .take(MAX_HISTORY_LIMIT as usize)
            .map(|r| RoutePoint {
                latitude: r.latitude,
                longitude: r.longitude,
                speed: r.speed,
                recorded_at: r.recorded_at,
            })
            .collect();

        Ok(DailyRoute::from_points(date, points))
    }

    async fn health_check(&self) -> Result<(), TrackerError> {
        Ok(())
    }
}

#[async_trait]
impl GeofenceStore for MemoryStore {
    async fn active_geofences(&self) -> Result<Vec<Geofence>, TrackerError> {
        let state = self.state.read().await;
        Ok(state.geofences.iter().filter(|g| g.active).cloned().collect())
    }

    async fn record_geofence_event(
        &self,
        vehicle_id: &VehicleId,
        geofence_id: &str,
        kind: GeofenceEventKind,
        position: Point,
    ) -> Result<GeofenceEvent, TrackerError> {
        let mut state = self.state.write().await;
        let event = GeofenceEvent {
            id: state.next_id(),
            vehicle_id: vehicle_id.clone(),
            geofence_id: geofence_id.to_string(),
            kind,
            latitude: position.latitude,
            longitude: position.longitude,
            occurred_at: Utc::now(),
        };
        state.events.push(event.clone());
        Ok(event)
    }

    async fn recent_geofence_events(
        &self,
        vehicle_id: &VehicleId,
        limit: u32,
    ) -> Result<Vec<GeofenceEvent>, TrackerError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|e| &e.vehicle_id == vehicle_id)
            .take(limit.min(MAX_HISTORY_LIMIT) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn owner_of(&self, vehicle_id: &VehicleId) -> Result<Option<UserId>, TrackerError> {
        let state = self.state.read().await;
        Ok(state
            .vehicles
            .get(vehicle_id)
            .and_then(|vehicle| vehicle.owner.clone()))
    }

    async fn insert_alert(
        &self,
        user_id: &UserId,
        vehicle_id: &VehicleId,
        alert: &NewAlert,
    ) -> Result<Alert, TrackerError> {
        let mut state = self.state.write().await;
        let alert = Alert {
            id: state.next_id(),
            user_id: user_id.clone(),
            vehicle_id: vehicle_id.clone(),
            kind: alert.kind.clone(),
            title: alert.title.clone(),
            message: alert.message.clone(),
            severity: alert.severity,
            created_at: Utc::now(),
        };
        state.alerts.push(alert.clone());
        Ok(alert)
    }

    async fn recent_alerts(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<Alert>, TrackerError> {
        let state = self.state.read().await;
        Ok(state
            .alerts
            .iter()
            .rev()
            .filter(|a| &a.user_id == user_id)
            .take(limit.min(MAX_HISTORY_LIMIT) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GeofenceShape, Telemetry};
    use chrono::{DateTime, TimeZone};

    fn update(id: &str, latitude: f64, longitude: f64, at: DateTime<Utc>) -> LocationUpdate {
        LocationUpdate {
            vehicle_id: VehicleId::try_from(id).unwrap(),
            position: Point::new(latitude, longitude).unwrap(),
            telemetry: Telemetry::default(),
            timestamp: at,
        }
    }

    fn profile(id: &str, active: bool) -> VehicleProfile {
        VehicleProfile {
            id: VehicleId::try_from(id).unwrap(),
            owner: Some(UserId::new(format!("owner-of-{id}"))),
            vehicle_number: Some(format!("{id}-PLATE")),
            model: None,
            active,
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_vehicle() {
        let store = MemoryStore::new();
        store.upsert(&update("V1", 37.0, 127.0, at(9, 0))).await.unwrap();
        store.upsert(&update("V1", 38.0, 128.0, at(9, 1))).await.unwrap();

        let id = VehicleId::try_from("V1").unwrap();
        let current = store.get_location(&id).await.unwrap();
        assert_eq!((current.latitude, current.longitude), (38.0, 128.0));
        assert_eq!(store.state.read().await.locations.len(), 1);

        let history = store.get_history(&id, &HistoryQuery::default()).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_get_location_not_found() {
        let store = MemoryStore::new();
        let id = VehicleId::try_from("ghost").unwrap();
        assert!(matches!(
            store.get_location(&id).await,
            Err(TrackerError::NotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_history_range_and_order() {
        let store = MemoryStore::new();
        for minute in 0..5 {
            store
                .upsert(&update("V1", 37.0, 127.0, at(10, minute)))
                .await
                .unwrap();
        }
        let id = VehicleId::try_from("V1").unwrap();

        let query = HistoryQuery {
            from: Some(at(10, 1)),
            to: Some(at(10, 3)),
            limit: None,
        };
        let records = store.get_history(&id, &query).await.unwrap();
        let times: Vec<_> = records.iter().map(|r| r.recorded_at).collect();
        assert_eq!(times, vec![at(10, 3), at(10, 2), at(10, 1)]);

        let query = HistoryQuery {
            limit: Some(2),
            ..Default::default()
        };
        let records = store.get_history(&id, &query).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].recorded_at, at(10, 4));
    }

    #[tokio::test]
    async fn test_get_many_skips_inactive_and_unknown() {
        let store = MemoryStore::new();
        store.register_vehicle(profile("A", true)).await;
        store.register_vehicle(profile("B", false)).await;
        store.register_vehicle(profile("C", true)).await;
        store.upsert(&update("A", 1.0, 1.0, at(8, 0))).await.unwrap();
        store.upsert(&update("B", 1.0, 1.0, at(8, 0))).await.unwrap();

        let ids: Vec<VehicleId> = ["A", "B", "C", "ZZ"]
            .into_iter()
            .map(|id| VehicleId::try_from(id).unwrap())
            .collect();
        let summaries = store.get_many(&ids).await.unwrap();

        let returned: Vec<&str> = summaries.iter().map(|s| s.vehicle_id.as_str()).collect();
        assert_eq!(returned, vec!["A", "C"]);
        assert_eq!(summaries[0].latitude, Some(1.0));
        assert_eq!(summaries[1].latitude, None);
    }

    #[tokio::test]
    async fn test_get_nearby_orders_and_filters() {
        let store = MemoryStore::new();
        for (id, lat) in [("far", 37.60), ("near", 37.5670), ("mid", 37.5700), ("idle", 37.5666)] {
            store.register_vehicle(profile(id, id != "idle")).await;
            store.upsert(&update(id, lat, 126.9780, at(7, 0))).await.unwrap();
        }

        let center = Point::new(37.5665, 126.9780).unwrap();
        let nearby = store.get_nearby(center, 1000.0).await.unwrap();

        let ids: Vec<&str> = nearby.iter().map(|n| n.vehicle_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
        assert!(nearby.iter().all(|n| n.distance_m <= 1000.0));
        assert!(nearby[0].distance_m < nearby[1].distance_m);

        assert!(store.get_nearby(center, 0.0).await.is_err());
    }

    #[tokio::test]
    async fn test_get_nearby_truncates() {
        let store = MemoryStore::new();
        for i in 0..(MAX_NEARBY_RESULTS + 10) {
            let id = format!("V{i}");
            store.register_vehicle(profile(&id, true)).await;
            let lat = 10.0 + f64::from(i) * 0.0001;
            store.upsert(&update(&id, lat, 10.0, at(7, 0))).await.unwrap();
        }

        let nearby = store
            .get_nearby(Point::new(10.0, 10.0).unwrap(), 50_000.0)
            .await
            .unwrap();
        assert_eq!(nearby.len(), MAX_NEARBY_RESULTS as usize);
        assert_eq!(nearby[0].vehicle_id.as_str(), "V0");
    }

    #[tokio::test]
    async fn test_route_for_one_day() {
        let store = MemoryStore::new();
        store.upsert(&update("V1", 1.0, 1.0, at(23, 0))).await.unwrap();
        store.upsert(&update("V1", 2.0, 2.0, at(6, 0))).await.unwrap();
        let next_day = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        store.upsert(&update("V1", 3.0, 3.0, next_day)).await.unwrap();

        let id = VehicleId::try_from("V1").unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let route = store.get_route(&id, date).await.unwrap();

        assert_eq!(route.points.len(), 2);
        assert_eq!(route.points[0].recorded_at, at(6, 0));
        assert_eq!(route.line, Some(vec![[2.0, 2.0], [1.0, 1.0]]));
    }

    #[tokio::test]
    async fn test_active_geofences_only() {
        let store = MemoryStore::new();
        let shape = GeofenceShape::Circle {
            center: Point::new(0.0, 0.0).unwrap(),
            radius_m: 10.0,
        };
        for (id, active) in [("on", true), ("off", false)] {
            store
                .add_geofence(Geofence {
                    id: id.to_string(),
                    name: id.to_string(),
                    shape: shape.clone(),
                    active,
                })
                .await;
        }

        let active = store.active_geofences().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "on");
    }
}
