// src/database/models.rs
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use crate::{
    errors::TrackerError,
    models::{
        Alert, Geofence, GeofenceEvent, GeofenceShape, LocationHistoryRecord, NearbyVehicle,
        Point, RoutePoint, UserId, VehicleId, VehicleLocation, VehicleSummary,
    },
};

#[derive(Debug, sqlx::FromRow)]
pub(super) struct LocationRow {
    vehicle_id: String,
    latitude: f64,
    longitude: f64,
    altitude: Option<f64>,
    speed: Option<f64>,
    heading: Option<f64>,
    accuracy: Option<f64>,
    reported_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LocationRow> for VehicleLocation {
    type Error = TrackerError;

    fn try_from(row: LocationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            vehicle_id: VehicleId::try_from(row.vehicle_id)?,
            latitude: row.latitude,
            longitude: row.longitude,
            altitude: row.altitude,
            speed: row.speed,
            heading: row.heading,
            accuracy: row.accuracy,
            timestamp: row.reported_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct HistoryRow {
    id: i64,
    vehicle_id: String,
    latitude: f64,
    longitude: f64,
    altitude: Option<f64>,
    speed: Option<f64>,
    heading: Option<f64>,
    accuracy: Option<f64>,
    battery_level: Option<f64>,
    is_charging: Option<bool>,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for LocationHistoryRecord {
    type Error = TrackerError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            vehicle_id: VehicleId::try_from(row.vehicle_id)?,
            latitude: row.latitude,
            longitude: row.longitude,
            altitude: row.altitude,
            speed: row.speed,
            heading: row.heading,
            accuracy: row.accuracy,
            battery_level: row.battery_level,
            is_charging: row.is_charging,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct SummaryRow {
    id: String,
    vehicle_number: Option<String>,
    model: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    speed: Option<f64>,
    heading: Option<f64>,
    reported_at: Option<DateTime<Utc>>,
}

impl TryFrom<SummaryRow> for VehicleSummary {
    type Error = TrackerError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            vehicle_id: VehicleId::try_from(row.id)?,
            vehicle_number: row.vehicle_number,
            model: row.model,
            latitude: row.latitude,
            longitude: row.longitude,
            speed: row.speed,
            heading: row.heading,
            timestamp: row.reported_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct NearbyRow {
    id: String,
    vehicle_number: Option<String>,
    model: Option<String>,
    latitude: f64,
    longitude: f64,
    speed: Option<f64>,
    distance_m: f64,
}

impl TryFrom<NearbyRow> for NearbyVehicle {
    type Error = TrackerError;

    fn try_from(row: NearbyRow) -> Result<Self, Self::Error> {
        Ok(Self {
            vehicle_id: VehicleId::try_from(row.id)?,
            vehicle_number: row.vehicle_number,
            model: row.model,
            latitude: row.latitude,
            longitude: row.longitude,
            speed: row.speed,
            distance_m: row.distance_m,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct RouteRow {
    latitude: f64,
    longitude: f64,
    speed: Option<f64>,
    recorded_at: DateTime<Utc>,
}

impl From<RouteRow> for RoutePoint {
    fn from(row: RouteRow) -> Self {
        Self {
            latitude: row.latitude,
            longitude: row.longitude,
            speed: row.speed,
            recorded_at: row.recorded_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct GeofenceRow {
    id: String,
    name: String,
    kind: String,
    center_latitude: Option<f64>,
    center_longitude: Option<f64>,
    radius_m: Option<f64>,
    vertices: Option<Json<Vec<Point>>>,
    is_active: bool,
}

impl TryFrom<GeofenceRow> for Geofence {
    type Error = TrackerError;

    fn try_from(row: GeofenceRow) -> Result<Self, Self::Error> {
        let shape = match (row.kind.as_str(), row.vertices) {
            ("circle", _) => match (row.center_latitude, row.center_longitude, row.radius_m) {
                (Some(lat), Some(lon), Some(radius_m)) if radius_m > 0.0 => {
                    GeofenceShape::Circle {
                        center: Point::new(lat, lon)?,
                        radius_m,
                    }
                }
                _ => {
                    return Err(TrackerError::Validation(format!(
                        "geofence {} is a circle without center or radius",
                        row.id
                    )))
                }
            },
            ("polygon", Some(Json(vertices))) if vertices.len() >= 3 => GeofenceShape::Polygon {
                vertices: vertices
                    .into_iter()
                    .map(|v| Point::new(v.latitude, v.longitude))
                    .collect::<Result<_, _>>()?,
            },
            (kind, _) => {
                return Err(TrackerError::Validation(format!(
                    "geofence {} has unusable {} boundary",
                    row.id, kind
                )))
            }
        };

        Ok(Self {
            id: row.id,
            name: row.name,
            shape,
            active: row.is_active,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct GeofenceEventRow {
    id: i64,
    vehicle_id: String,
    geofence_id: String,
    event_type: String,
    latitude: f64,
    longitude: f64,
    occurred_at: DateTime<Utc>,
}

impl TryFrom<GeofenceEventRow> for GeofenceEvent {
    type Error = TrackerError;

    fn try_from(row: GeofenceEventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            vehicle_id: VehicleId::try_from(row.vehicle_id)?,
            geofence_id: row.geofence_id,
            kind: row.event_type.parse()?,
            latitude: row.latitude,
            longitude: row.longitude,
            occurred_at: row.occurred_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct AlertRow {
    id: i64,
    user_id: String,
    vehicle_id: String,
    #[sqlx(rename = "type")]
    kind: String,
    title: String,
    message: String,
    severity: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = TrackerError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: UserId::new(row.user_id),
            vehicle_id: VehicleId::try_from(row.vehicle_id)?,
            kind: row.kind,
            title: row.title,
            message: row.message,
            severity: row.severity.parse()?,
            created_at: row.created_at,
        })
    }
}
