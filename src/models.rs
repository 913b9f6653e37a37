//! Data models.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::TrackerError;

/// Default number of history records returned when the caller sets no limit.
pub const DEFAULT_HISTORY_LIMIT: u32 = 1000;
/// Hard cap on history records returned by a single query.
pub const MAX_HISTORY_LIMIT: u32 = 5000;
/// Hard cap on vehicles returned by a proximity search.
pub const MAX_NEARBY_RESULTS: u32 = 50;
/// Proximity search radius used when the caller sets none.
pub const DEFAULT_NEARBY_RADIUS_M: f64 = 5000.0;

/// Vehicle identifier
///
/// Any non-blank string; surrounding whitespace is trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VehicleId(String);

impl TryFrom<String> for VehicleId {
    type Error = TrackerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(TrackerError::validation("vehicle id is required"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<&str> for VehicleId {
    type Error = TrackerError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl From<VehicleId> for String {
    fn from(id: VehicleId) -> Self {
        id.0
    }
}

impl VehicleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owning user of a vehicle, as resolved by the vehicle registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
}

impl Point {
    /// Create a point, rejecting latitudes outside [-90, 90] and
    /// longitudes outside [-180, 180].
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, TrackerError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(TrackerError::validation(format!(
                "latitude {} is outside [-90, 90]",
                latitude
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(TrackerError::validation(format!(
                "longitude {} is outside [-180, 180]",
                longitude
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// Optional readings that accompany a position report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    /// Altitude in meters
    pub altitude: Option<f64>,
    /// Ground speed as reported by the device
    pub speed: Option<f64>,
    /// Heading in degrees
    pub heading: Option<f64>,
    /// Horizontal accuracy in meters
    pub accuracy: Option<f64>,
    pub battery_level: Option<f64>,
    pub is_charging: Option<bool>,
}

/// Position report as received from a device, before validation.
///
/// Latitude and longitude are optional here so that a missing field is
/// reported as a validation failure rather than a parse failure.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationReport {
    pub vehicle_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    /// Report time; receipt time is used when absent
    pub timestamp: Option<DateTime<Utc>>,
    pub battery_level: Option<f64>,
    pub is_charging: Option<bool>,
}

impl LocationReport {
    /// Validate the report, producing an update that is safe to persist.
    pub fn validate(self, received_at: DateTime<Utc>) -> Result<LocationUpdate, TrackerError> {
        let vehicle_id = VehicleId::try_from(self.vehicle_id.unwrap_or_default())?;
        let latitude = self
            .latitude
            .ok_or_else(|| TrackerError::validation("latitude is required"))?;
        let longitude = self
            .longitude
            .ok_or_else(|| TrackerError::validation("longitude is required"))?;

        Ok(LocationUpdate {
            vehicle_id,
            position: Point::new(latitude, longitude)?,
            telemetry: Telemetry {
                altitude: self.altitude,
                speed: self.speed,
                heading: self.heading,
                accuracy: self.accuracy,
                battery_level: self.battery_level,
                is_charging: self.is_charging,
            },
            timestamp: self.timestamp.unwrap_or(received_at),
        })
    }
}

/// Validated position update.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub vehicle_id: VehicleId,
    pub position: Point,
    pub telemetry: Telemetry,
    pub timestamp: DateTime<Utc>,
}

/// Current location of a vehicle; one per vehicle id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleLocation {
    pub vehicle_id: VehicleId,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    /// Time the position was reported
    pub timestamp: DateTime<Utc>,
    /// Time the row was last written
    pub updated_at: DateTime<Utc>,
}

impl VehicleLocation {
    pub fn position(&self) -> Point {
        Point {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    pub fn seconds_ago(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.timestamp, now)
    }
}

/// Where a current-location read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationSource {
    Cache,
    Store,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedLocation {
    pub location: VehicleLocation,
    pub source: LocationSource,
}

/// Immutable snapshot written on every ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationHistoryRecord {
    pub id: i64,
    pub vehicle_id: VehicleId,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    pub battery_level: Option<f64>,
    pub is_charging: Option<bool>,
    pub recorded_at: DateTime<Utc>,
}

/// Filter for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl HistoryQuery {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(TrackerError::validation(format!(
                    "history range start {} is after end {}",
                    from, to
                )));
            }
        }
        Ok(())
    }

    /// Caller limit, clamped to [`MAX_HISTORY_LIMIT`].
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .min(MAX_HISTORY_LIMIT)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

/// Registry entry for a vehicle, maintained outside the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleProfile {
    pub id: VehicleId,
    pub owner: Option<UserId>,
    pub vehicle_number: Option<String>,
    pub model: Option<String>,
    pub active: bool,
}

/// Active vehicle joined with its current location, if any.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleSummary {
    pub vehicle_id: VehicleId,
    pub vehicle_number: Option<String>,
    pub model: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl VehicleSummary {
    pub fn seconds_ago(&self, now: DateTime<Utc>) -> Option<f64> {
        self.timestamp.map(|at| seconds_between(at, now))
    }
}

/// Result row of a proximity search.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyVehicle {
    pub vehicle_id: VehicleId,
    pub vehicle_number: Option<String>,
    pub model: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    /// Geodesic distance to the search point in meters
    pub distance_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePoint {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Points driven on one UTC day, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRoute {
    pub date: NaiveDate,
    pub points: Vec<RoutePoint>,
    /// `[longitude, latitude]` pairs, present only with two or more points
    pub line: Option<Vec<[f64; 2]>>,
}

impl DailyRoute {
    pub fn from_points(date: NaiveDate, points: Vec<RoutePoint>) -> Self {
        let line = (points.len() > 1).then(|| {
            points
                .iter()
                .map(|p| [p.longitude, p.latitude])
                .collect()
        });
        Self { date, points, line }
    }
}

/// Region boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GeofenceShape {
    Circle { center: Point, radius_m: f64 },
    /// Vertices in order; the ring is closed implicitly
    Polygon { vertices: Vec<Point> },
}

/// Named region with enter/exit semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: String,
    pub name: String,
    pub shape: GeofenceShape,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeofenceEventKind {
    Enter,
    Exit,
}

impl GeofenceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Exit => "exit",
        }
    }
}

impl FromStr for GeofenceEventKind {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enter" => Ok(Self::Enter),
            "exit" => Ok(Self::Exit),
            other => Err(TrackerError::validation(format!(
                "unknown geofence event type {}",
                other
            ))),
        }
    }
}

/// Detected containment transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceEvent {
    pub id: i64,
    pub vehicle_id: VehicleId,
    pub geofence_id: String,
    pub kind: GeofenceEventKind,
    pub latitude: f64,
    pub longitude: f64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(TrackerError::validation(format!(
                "unknown severity {}",
                other
            ))),
        }
    }
}

/// Alert content, before an owner is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub kind: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

/// User-facing notification, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: i64,
    pub user_id: UserId,
    pub vehicle_id: VehicleId,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}
