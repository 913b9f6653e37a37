//! Vehicle tracking: position ingestion, current-location cache, geofence
//! transitions, alerts and real-time fan-out.

pub mod alerts;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod database;
pub mod errors;
pub mod geo;
pub mod geofence;
pub mod ingest;
pub mod models;
pub mod mqtt;
pub mod tracker;

pub use errors::TrackerError;
pub use tracker::{HealthStatus, Tracker};
