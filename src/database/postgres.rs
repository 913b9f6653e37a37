// src/database/postgres.rs
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use super::{
    check_radius, day_bounds,
    models::{
        AlertRow, GeofenceEventRow, GeofenceRow, HistoryRow, LocationRow, NearbyRow, RouteRow,
        SummaryRow,
    },
    AlertStore, GeofenceStore, LocationStore,
};
use crate::{
    config::DatabaseConfig,
    errors::TrackerError,
    models::{
        Alert, DailyRoute, Geofence, GeofenceEvent, GeofenceEventKind, HistoryQuery,
        LocationHistoryRecord, LocationUpdate, NearbyVehicle, NewAlert, Point, RoutePoint,
        UserId, VehicleId, VehicleLocation, VehicleSummary, MAX_HISTORY_LIMIT,
        MAX_NEARBY_RESULTS,
    },
};

const LOCATION_COLUMNS: &str =
    "vehicle_id, latitude, longitude, altitude, speed, heading, accuracy, reported_at, updated_at";

const HISTORY_COLUMNS: &str = "id, vehicle_id, latitude, longitude, altitude, speed, heading, \
     accuracy, battery_level, is_charging, recorded_at";

const EVENT_COLUMNS: &str =
    "id, vehicle_id, geofence_id, event_type, latitude, longitude, occurred_at";

const ALERT_COLUMNS: &str =
    "id, user_id, vehicle_id, type, title, message, severity, created_at";

/// PostgreSQL/PostGIS backed store
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Wrap an existing pool and bring the schema up to date.
    pub async fn new(pool: PgPool) -> Result<Self, TrackerError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Connect with pool settings from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, TrackerError> {
        config.validate()?;

        info!(
            "Connecting to database: max_connections={}, acquire_timeout={:?}",
            config.max_connections, config.acquire_timeout
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        Self::new(pool).await
    }

    pub async fn from_url(url: &str) -> Result<Self, TrackerError> {
        let pool = PgPool::connect(url).await?;
        Self::new(pool).await
    }

    /// Release all pooled connections.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

#[async_trait]
impl LocationStore for Database {
    async fn upsert_location(
        &self,
        update: &LocationUpdate,
    ) -> Result<VehicleLocation, TrackerError> {
        let query = format!(
            "INSERT INTO vehicle_locations (
                vehicle_id, location, latitude, longitude, altitude,
                speed, heading, accuracy, reported_at, updated_at
            ) VALUES (
                $1, ST_SetSRID(ST_MakePoint($3, $2), 4326)::geography,
                $2, $3, $4, $5, $6, $7, $8, now()
            )
            ON CONFLICT (vehicle_id) DO UPDATE SET
                location = EXCLUDED.location,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                altitude = EXCLUDED.altitude,
                speed = EXCLUDED.speed,
                heading = EXCLUDED.heading,
                accuracy = EXCLUDED.accuracy,
                reported_at = EXCLUDED.reported_at,
                updated_at = now()
            RETURNING {LOCATION_COLUMNS}"
        );

        let row: LocationRow = sqlx::query_as(&query)
            .bind(update.vehicle_id.as_str())
            .bind(update.position.latitude)
            .bind(update.position.longitude)
            .bind(update.telemetry.altitude)
            .bind(update.telemetry.speed)
            .bind(update.telemetry.heading)
            .bind(update.telemetry.accuracy)
            .bind(update.timestamp)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn append_history(
        &self,
        update: &LocationUpdate,
    ) -> Result<LocationHistoryRecord, TrackerError> {
        let query = format!(
            "INSERT INTO location_history (
                vehicle_id, latitude, longitude, altitude, speed, heading,
                accuracy, battery_level, is_charging, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {HISTORY_COLUMNS}"
        );

        let row: HistoryRow = sqlx::query_as(&query)
            .bind(update.vehicle_id.as_str())
            .bind(update.position.latitude)
            .bind(update.position.longitude)
            .bind(update.telemetry.altitude)
            .bind(update.telemetry.speed)
            .bind(update.telemetry.heading)
            .bind(update.telemetry.accuracy)
            .bind(update.telemetry.battery_level)
            .bind(update.telemetry.is_charging)
            .bind(update.timestamp)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn get_location(&self, vehicle_id: &VehicleId) -> Result<VehicleLocation, TrackerError> {
        let query =
            format!("SELECT {LOCATION_COLUMNS} FROM vehicle_locations WHERE vehicle_id = $1");

        let row: Option<LocationRow> = sqlx::query_as(&query)
            .bind(vehicle_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(TrackerError::NotFound(vehicle_id.clone())),
        }
    }

    async fn get_many(&self, ids: &[VehicleId]) -> Result<Vec<VehicleSummary>, TrackerError> {
        let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();

        let rows: Vec<SummaryRow> = sqlx::query_as(
            "SELECT v.id, v.vehicle_number, v.model,
                    vl.latitude, vl.longitude, vl.speed, vl.heading, vl.reported_at
             FROM vehicles v
             LEFT JOIN vehicle_locations vl ON v.id = vl.vehicle_id
             WHERE v.id = ANY($1) AND v.is_active = true
             ORDER BY v.id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(VehicleSummary::try_from).collect()
    }

    async fn get_history(
        &self,
        vehicle_id: &VehicleId,
        query: &HistoryQuery,
    ) -> Result<Vec<LocationHistoryRecord>, TrackerError> {
        query.validate()?;

        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM location_history
             WHERE vehicle_id = $1
               AND ($2::timestamptz IS NULL OR recorded_at >= $2)
               AND ($3::timestamptz IS NULL OR recorded_at <= $3)
             ORDER BY recorded_at DESC, id DESC
             LIMIT $4"
        );

        let rows: Vec<HistoryRow> = sqlx::query_as(&sql)
            .bind(vehicle_id.as_str())
            .bind(query.from)
            .bind(query.to)
            .bind(i64::from(query.effective_limit()))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(LocationHistoryRecord::try_from).collect()
    }

    async fn get_nearby(
        &self,
        point: Point,
        radius_m: f64,
    ) -> Result<Vec<NearbyVehicle>, TrackerError> {
        check_radius(radius_m)?;

        let rows: Vec<NearbyRow> = sqlx::query_as(
            "SELECT v.id, v.vehicle_number, v.model,
                    vl.latitude, vl.longitude, vl.speed,
                    ST_Distance(
                        vl.location,
                        ST_SetSRID(ST_MakePoint($2, $1), 4326)::geography
                    ) AS distance_m
             FROM vehicles v
             INNER JOIN vehicle_locations vl ON v.id = vl.vehicle_id
             WHERE ST_DWithin(
                     vl.location,
                     ST_SetSRID(ST_MakePoint($2, $1), 4326)::geography,
                     $3
                   )
               AND v.is_active = true
             ORDER BY distance_m ASC
             LIMIT $4",
        )
        .bind(point.latitude)
        .bind(point.longitude)
        .bind(radius_m)
        .bind(i64::from(MAX_NEARBY_RESULTS))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NearbyVehicle::try_from).collect()
    }

    async fn get_route(
        &self,
        vehicle_id: &VehicleId,
        date: NaiveDate,
    ) -> Result<DailyRoute, TrackerError> {
        let (start, end) = day_bounds(date);

        let rows: Vec<RouteRow> = sqlx::query_as(
            "SELECT latitude, longitude, speed, recorded_at
             FROM location_history
             WHERE vehicle_id = $1 AND recorded_at >= $2 AND recorded_at < $3
             ORDER BY recorded_at ASC, id ASC
             LIMIT $4",
        )
        .bind(vehicle_id.as_str())
        .bind(start)
        .bind(end)
        .bind(i64::from(MAX_HISTORY_LIMIT))
        .fetch_all(&self.pool)
        .await?;

        let points: Vec<RoutePoint> = rows.into_iter().map(Into::into).collect();
        Ok(DailyRoute::from_points(date, points))
    }

    async fn health_check(&self) -> Result<(), TrackerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl GeofenceStore for Database {
    async fn active_geofences(&self) -> Result<Vec<Geofence>, TrackerError> {
        let rows: Vec<GeofenceRow> = sqlx::query_as(
            "SELECT id, name, kind, center_latitude, center_longitude, radius_m,
                    vertices, is_active
             FROM geofences
             WHERE is_active = true",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut geofences = Vec::with_capacity(rows.len());
        for row in rows {
            match Geofence::try_from(row) {
                Ok(geofence) => geofences.push(geofence),
                Err(e) => warn!("Skipping geofence: {}", e),
            }
        }
        Ok(geofences)
    }

    async fn record_geofence_event(
        &self,
        vehicle_id: &VehicleId,
        geofence_id: &str,
        kind: GeofenceEventKind,
        position: Point,
    ) -> Result<GeofenceEvent, TrackerError> {
        let query = format!(
            "INSERT INTO geofence_events (
                vehicle_id, geofence_id, event_type, location, latitude, longitude, occurred_at
            ) VALUES (
                $1, $2, $3,
                ST_SetSRID(ST_MakePoint($5, $4), 4326)::geography,
                $4, $5, now()
            )
            RETURNING {EVENT_COLUMNS}"
        );

        let row: GeofenceEventRow = sqlx::query_as(&query)
            .bind(vehicle_id.as_str())
            .bind(geofence_id)
            .bind(kind.as_str())
            .bind(position.latitude)
            .bind(position.longitude)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn recent_geofence_events(
        &self,
        vehicle_id: &VehicleId,
        limit: u32,
    ) -> Result<Vec<GeofenceEvent>, TrackerError> {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM geofence_events
             WHERE vehicle_id = $1
             ORDER BY occurred_at DESC, id DESC
             LIMIT $2"
        );

        let rows: Vec<GeofenceEventRow> = sqlx::query_as(&query)
            .bind(vehicle_id.as_str())
            .bind(i64::from(limit.min(MAX_HISTORY_LIMIT)))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(GeofenceEvent::try_from).collect()
    }
}

#[async_trait]
impl AlertStore for Database {
    async fn owner_of(&self, vehicle_id: &VehicleId) -> Result<Option<UserId>, TrackerError> {
        let owner: Option<Option<String>> =
            sqlx::query_scalar("SELECT user_id FROM vehicles WHERE id = $1")
                .bind(vehicle_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(owner.flatten().map(UserId::new))
    }

    async fn insert_alert(
        &self,
        user_id: &UserId,
        vehicle_id: &VehicleId,
        alert: &NewAlert,
    ) -> Result<Alert, TrackerError> {
        let query = format!(
            "INSERT INTO alerts (user_id, vehicle_id, type, title, message, severity)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {ALERT_COLUMNS}"
        );

        let row: AlertRow = sqlx::query_as(&query)
            .bind(user_id.as_str())
            .bind(vehicle_id.as_str())
            .bind(&alert.kind)
            .bind(&alert.title)
            .bind(&alert.message)
            .bind(alert.severity.as_str())
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn recent_alerts(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<Alert>, TrackerError> {
        let query = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts
             WHERE user_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2"
        );

        let rows: Vec<AlertRow> = sqlx::query_as(&query)
            .bind(user_id.as_str())
            .bind(i64::from(limit.min(MAX_HISTORY_LIMIT)))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Alert::try_from).collect()
    }
}
