//! Geofence transition detection.
//!
//! After every accepted position the vehicle is tested against each active
//! geofence. A per (vehicle, geofence) flag in the key-value cache remembers
//! containment: the key exists only while the vehicle is believed inside,
//! with a TTL so that vehicles that stop reporting do not pin entries.
//!
//! Known approximations:
//! - A vehicle that stays inside one geofence for longer than the state TTL
//!   gets a second ENTER on the first update after the flag expires.
//! - The read and write of the flag are not atomic. Updates for one vehicle
//!   are evaluated in arrival order by [`GeofenceWorkers`], but two ingestion
//!   paths reporting the same vehicle can still miss or duplicate a
//!   transition.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    alerts::AlertDispatcher,
    cache::KeyValueCache,
    config::GeofenceConfig,
    database::GeofenceStore,
    errors::TrackerError,
    geo,
    models::{
        Geofence, GeofenceEvent, GeofenceEventKind, NewAlert, Severity, VehicleId,
        VehicleLocation,
    },
};

/// Default lifetime of an INSIDE flag.
pub const STATE_TTL: Duration = Duration::from_secs(3600);

const INSIDE: &str = "inside";

fn state_key(vehicle_id: &VehicleId, geofence_id: &str) -> String {
    format!("geofence:{}:{}", vehicle_id, geofence_id)
}

/// Stable shard for a vehicle id among `shards` workers.
pub(crate) fn shard_index(vehicle_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    vehicle_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Two-state containment memory per (vehicle, geofence) pair.
#[derive(Clone)]
pub struct GeofenceStateTracker {
    cache: Arc<dyn KeyValueCache>,
    ttl: Duration,
}

impl GeofenceStateTracker {
    pub fn new(cache: Arc<dyn KeyValueCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// Edge implied by `contained` against the stored flag. Nothing is written.
    pub async fn transition(
        &self,
        vehicle_id: &VehicleId,
        geofence_id: &str,
        contained: bool,
    ) -> Result<Option<GeofenceEventKind>, TrackerError> {
        let key = state_key(vehicle_id, geofence_id);
        let was_inside = self.cache.get(&key).await?.as_deref() == Some(INSIDE);

        Ok(match (contained, was_inside) {
            (true, false) => Some(GeofenceEventKind::Enter),
            (false, true) => Some(GeofenceEventKind::Exit),
            _ => None,
        })
    }

    /// Store the state reached by a transition.
    pub async fn commit(
        &self,
        vehicle_id: &VehicleId,
        geofence_id: &str,
        kind: GeofenceEventKind,
    ) -> Result<(), TrackerError> {
        let key = state_key(vehicle_id, geofence_id);
        match kind {
            GeofenceEventKind::Enter => self.cache.set_ex(&key, INSIDE, self.ttl).await,
            GeofenceEventKind::Exit => self.cache.delete(&key).await,
        }
    }

    /// Detect and immediately commit an edge.
    pub async fn observe(
        &self,
        vehicle_id: &VehicleId,
        geofence_id: &str,
        contained: bool,
    ) -> Result<Option<GeofenceEventKind>, TrackerError> {
        let kind = self.transition(vehicle_id, geofence_id, contained).await?;
        if let Some(kind) = kind {
            self.commit(vehicle_id, geofence_id, kind).await?;
        }
        Ok(kind)
    }
}

/// Alert content for a transition: info on enter, warning on exit.
pub fn transition_alert(
    vehicle_id: &VehicleId,
    geofence: &Geofence,
    kind: GeofenceEventKind,
) -> NewAlert {
    match kind {
        GeofenceEventKind::Enter => NewAlert {
            kind: "geofence_enter".to_string(),
            title: format!("Entered {}", geofence.name),
            message: format!("Vehicle {} entered {}.", vehicle_id, geofence.name),
            severity: Severity::Info,
        },
        GeofenceEventKind::Exit => NewAlert {
            kind: "geofence_exit".to_string(),
            title: format!("Left {}", geofence.name),
            message: format!("Vehicle {} left {}.", vehicle_id, geofence.name),
            severity: Severity::Warning,
        },
    }
}

/// Outcome of evaluating one position against all active geofences.
#[derive(Debug, Default)]
pub struct EvaluationSummary {
    pub evaluated: usize,
    pub transitions: Vec<GeofenceEvent>,
    pub failures: usize,
}

/// Evaluates one position against every active geofence.
pub struct GeofencePipeline {
    geofences: Arc<dyn GeofenceStore>,
    states: GeofenceStateTracker,
    alerts: AlertDispatcher,
}

impl GeofencePipeline {
    pub fn new(
        geofences: Arc<dyn GeofenceStore>,
        states: GeofenceStateTracker,
        alerts: AlertDispatcher,
    ) -> Self {
        Self {
            geofences,
            states,
            alerts,
        }
    }

    /// Evaluate all active geofences for `location`.
    ///
    /// A failure on one geofence is logged and counted; the remaining
    /// geofences are still evaluated.
    pub async fn evaluate(
        &self,
        location: &VehicleLocation,
    ) -> Result<EvaluationSummary, TrackerError> {
        let geofences = self.geofences.active_geofences().await?;
        let mut summary = EvaluationSummary::default();

        for geofence in &geofences {
            summary.evaluated += 1;
            match self.evaluate_one(location, geofence).await {
                Ok(Some(event)) => summary.transitions.push(event),
                Ok(None) => {}
                Err(e) => {
                    summary.failures += 1;
                    warn!(
                        "Geofence {} evaluation failed for vehicle {}: {}",
                        geofence.id, location.vehicle_id, e
                    );
                }
            }
        }

        Ok(summary)
    }

    async fn evaluate_one(
        &self,
        location: &VehicleLocation,
        geofence: &Geofence,
    ) -> Result<Option<GeofenceEvent>, TrackerError> {
        let contained = geo::contains(location.position(), &geofence.shape);

        let Some(kind) = self
            .states
            .transition(&location.vehicle_id, &geofence.id, contained)
            .await?
        else {
            return Ok(None);
        };

        // The event is persisted before the state moves, so a failed insert
        // is retried on the next update.
        let event = self
            .geofences
            .record_geofence_event(
                &location.vehicle_id,
                &geofence.id,
                kind,
                location.position(),
            )
            .await?;
        self.states
            .commit(&location.vehicle_id, &geofence.id, kind)
            .await?;
        info!(
            "Geofence {} {} by vehicle {}",
            geofence.id,
            kind.as_str(),
            location.vehicle_id
        );

        let alert = transition_alert(&location.vehicle_id, geofence, kind);
        if let Err(e) = self.alerts.create_alert(&location.vehicle_id, alert).await {
            error!(
                "Failed to create {} alert for vehicle {}: {}",
                kind.as_str(),
                location.vehicle_id,
                e
            );
        }

        Ok(Some(event))
    }
}

/// Background evaluation, decoupled from ingestion.
///
/// Jobs are sharded by vehicle id over a fixed number of workers, each with
/// a bounded queue, so one vehicle's updates are evaluated in arrival order
/// and total concurrency stays bounded. A full queue drops the job.
pub struct GeofenceWorkers {
    shards: Vec<mpsc::Sender<VehicleLocation>>,
    handles: Vec<JoinHandle<()>>,
}

impl GeofenceWorkers {
    pub fn spawn(pipeline: Arc<GeofencePipeline>, config: &GeofenceConfig) -> Self {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);

        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            shards.push(tx);
            handles.push(tokio::spawn(Self::run(shard, pipeline.clone(), rx)));
        }

        info!(
            "Started {} geofence workers, queue capacity {}",
            workers, capacity
        );
        Self { shards, handles }
    }

    /// Queue a position for evaluation without waiting.
    pub fn submit(&self, location: VehicleLocation) {
        let shard = self.shard_for(&location.vehicle_id);
        match self.shards[shard].try_send(location) {
            Ok(()) => {}
            Err(TrySendError::Full(location)) => warn!(
                "Geofence queue {} full, skipping evaluation for vehicle {}",
                shard, location.vehicle_id
            ),
            Err(TrySendError::Closed(location)) => warn!(
                "Geofence queue {} closed, skipping evaluation for vehicle {}",
                shard, location.vehicle_id
            ),
        }
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.shards);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Geofence worker ended abnormally: {}", e);
            }
        }
        info!("Geofence workers stopped");
    }

    fn shard_for(&self, vehicle_id: &VehicleId) -> usize {
        shard_index(vehicle_id.as_str(), self.shards.len())
    }

    async fn run(
        shard: usize,
        pipeline: Arc<GeofencePipeline>,
        mut rx: mpsc::Receiver<VehicleLocation>,
    ) {
        while let Some(location) = rx.recv().await {
            let vehicle_id = location.vehicle_id.clone();
            let pipeline = pipeline.clone();

            // Own task per job so a panic only loses that job.
            let job = tokio::spawn(async move { pipeline.evaluate(&location).await });
            match job.await {
                Ok(Ok(summary)) => debug!(
                    "Shard {}: vehicle {} vs {} geofences, {} transitions, {} failures",
                    shard,
                    vehicle_id,
                    summary.evaluated,
                    summary.transitions.len(),
                    summary.failures
                ),
                Ok(Err(e)) => error!("Geofence check failed for vehicle {}: {}", vehicle_id, e),
                Err(e) => error!("Geofence check for vehicle {} aborted: {}", vehicle_id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::FanOut;
    use crate::cache::MemoryCache;
    use crate::database::{AlertStore, MemoryStore};
    use crate::models::{GeofenceShape, Point, UserId, VehicleProfile};
    use async_trait::async_trait;
    use chrono::Utc;

    fn vehicle() -> VehicleId {
        VehicleId::try_from("V1").unwrap()
    }

    fn location(latitude: f64, longitude: f64) -> VehicleLocation {
        VehicleLocation {
            vehicle_id: vehicle(),
            latitude,
            longitude,
            altitude: None,
            speed: None,
            heading: None,
            accuracy: None,
            timestamp: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn circle(id: &str, latitude: f64, longitude: f64, radius_m: f64) -> Geofence {
        Geofence {
            id: id.to_string(),
            name: format!("{id} zone"),
            shape: GeofenceShape::Circle {
                center: Point::new(latitude, longitude).unwrap(),
                radius_m,
            },
            active: true,
        }
    }

    #[tokio::test]
    async fn test_single_enter_and_exit_over_sequence() {
        let tracker = GeofenceStateTracker::new(Arc::new(MemoryCache::new()), STATE_TTL);

        let mut edges = Vec::new();
        for contained in [false, false, true, true, false] {
            edges.push(tracker.observe(&vehicle(), "G1", contained).await.unwrap());
        }

        assert_eq!(
            edges,
            vec![
                None,
                None,
                Some(GeofenceEventKind::Enter),
                None,
                Some(GeofenceEventKind::Exit)
            ]
        );
    }

    #[tokio::test]
    async fn test_pairs_are_tracked_independently() {
        let tracker = GeofenceStateTracker::new(Arc::new(MemoryCache::new()), STATE_TTL);
        let other = VehicleId::try_from("V2").unwrap();

        assert_eq!(
            tracker.observe(&vehicle(), "G1", true).await.unwrap(),
            Some(GeofenceEventKind::Enter)
        );
        assert_eq!(
            tracker.observe(&vehicle(), "G2", true).await.unwrap(),
            Some(GeofenceEventKind::Enter)
        );
        assert_eq!(
            tracker.observe(&other, "G1", true).await.unwrap(),
            Some(GeofenceEventKind::Enter)
        );
        assert_eq!(tracker.observe(&other, "G1", true).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_enter_fires_again_after_state_expires() {
        let tracker =
            GeofenceStateTracker::new(Arc::new(MemoryCache::new()), Duration::from_millis(20));

        assert_eq!(
            tracker.observe(&vehicle(), "G1", true).await.unwrap(),
            Some(GeofenceEventKind::Enter)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            tracker.observe(&vehicle(), "G1", true).await.unwrap(),
            Some(GeofenceEventKind::Enter)
        );
    }

    #[test]
    fn test_transition_alert_policy() {
        let fence = circle("G1", 0.0, 0.0, 10.0);
        let enter = transition_alert(&vehicle(), &fence, GeofenceEventKind::Enter);
        let exit = transition_alert(&vehicle(), &fence, GeofenceEventKind::Exit);

        assert_eq!(enter.severity, Severity::Info);
        assert_eq!(enter.kind, "geofence_enter");
        assert_eq!(exit.severity, Severity::Warning);
        assert_eq!(exit.kind, "geofence_exit");
        assert!(exit.title.contains("G1 zone"));
    }

    /// Cache that fails for keys of one geofence only.
    struct FlakyCache {
        inner: MemoryCache,
        broken_geofence: &'static str,
    }

    #[async_trait]
    impl KeyValueCache for FlakyCache {
        async fn get(&self, key: &str) -> Result<Option<String>, TrackerError> {
            if key.ends_with(self.broken_geofence) {
                return Err(TrackerError::Cache("timeout".to_string()));
            }
            self.inner.get(key).await
        }

        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), TrackerError> {
            self.inner.set_ex(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), TrackerError> {
            self.inner.delete(key).await
        }

        async fn ping(&self) -> Result<(), TrackerError> {
            Ok(())
        }
    }

    async fn pipeline_with(
        store: Arc<MemoryStore>,
        cache: Arc<dyn KeyValueCache>,
    ) -> GeofencePipeline {
        let fanout = Arc::new(FanOut::new(Vec::new()));
        GeofencePipeline::new(
            store.clone(),
            GeofenceStateTracker::new(cache, STATE_TTL),
            AlertDispatcher::new(store, fanout),
        )
    }

    #[tokio::test]
    async fn test_failure_in_one_geofence_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        store.add_geofence(circle("bad", 37.57, 126.979, 200.0)).await;
        store.add_geofence(circle("good", 37.57, 126.979, 200.0)).await;
        let cache = Arc::new(FlakyCache {
            inner: MemoryCache::new(),
            broken_geofence: "bad",
        });
        let pipeline = pipeline_with(store.clone(), cache).await;

        let summary = pipeline.evaluate(&location(37.57, 126.979)).await.unwrap();

        assert_eq!(summary.evaluated, 2);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.transitions.len(), 1);
        assert_eq!(summary.transitions[0].geofence_id, "good");
    }

    /// Geofence store whose first event insert fails.
    struct FailFirstInsert {
        inner: Arc<MemoryStore>,
        failed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl GeofenceStore for FailFirstInsert {
        async fn active_geofences(&self) -> Result<Vec<Geofence>, TrackerError> {
            self.inner.active_geofences().await
        }

        async fn record_geofence_event(
            &self,
            vehicle_id: &VehicleId,
            geofence_id: &str,
            kind: GeofenceEventKind,
            position: Point,
        ) -> Result<GeofenceEvent, TrackerError> {
            if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(TrackerError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner
                .record_geofence_event(vehicle_id, geofence_id, kind, position)
                .await
        }

        async fn recent_geofence_events(
            &self,
            vehicle_id: &VehicleId,
            limit: u32,
        ) -> Result<Vec<GeofenceEvent>, TrackerError> {
            self.inner.recent_geofence_events(vehicle_id, limit).await
        }
    }

    #[tokio::test]
    async fn test_failed_event_insert_is_retried_on_next_update() {
        let store = Arc::new(MemoryStore::new());
        store.add_geofence(circle("G1", 37.5700, 126.9790, 200.0)).await;
        let geofences = Arc::new(FailFirstInsert {
            inner: store.clone(),
            failed: std::sync::atomic::AtomicBool::new(false),
        });
        let pipeline = GeofencePipeline::new(
            geofences,
            GeofenceStateTracker::new(Arc::new(MemoryCache::new()), STATE_TTL),
            AlertDispatcher::new(store.clone(), Arc::new(FanOut::new(Vec::new()))),
        );

        let first = pipeline.evaluate(&location(37.5700, 126.9790)).await.unwrap();
        assert_eq!(first.failures, 1);
        assert!(first.transitions.is_empty());

        let second = pipeline.evaluate(&location(37.5700, 126.9790)).await.unwrap();
        assert_eq!(second.transitions.len(), 1);
        assert_eq!(second.transitions[0].kind, GeofenceEventKind::Enter);

        let third = pipeline.evaluate(&location(37.5665, 126.9780)).await.unwrap();
        assert_eq!(third.transitions.len(), 1);

        let events = store.recent_geofence_events(&vehicle(), 10).await.unwrap();
        let kinds: Vec<GeofenceEventKind> = events.iter().rev().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![GeofenceEventKind::Enter, GeofenceEventKind::Exit]);
    }

    #[tokio::test]
    async fn test_pipeline_records_events_and_alerts() {
        let store = Arc::new(MemoryStore::new());
        let owner = UserId::new("U1");
        store
            .register_vehicle(VehicleProfile {
                id: vehicle(),
                owner: Some(owner.clone()),
                vehicle_number: None,
                model: None,
                active: true,
            })
            .await;
        store.add_geofence(circle("G1", 37.5700, 126.9790, 200.0)).await;
        let pipeline = pipeline_with(store.clone(), Arc::new(MemoryCache::new())).await;

        let outside = pipeline.evaluate(&location(37.5665, 126.9780)).await.unwrap();
        assert!(outside.transitions.is_empty());

        let inside = pipeline.evaluate(&location(37.5700, 126.9790)).await.unwrap();
        assert_eq!(inside.transitions.len(), 1);
        assert_eq!(inside.transitions[0].kind, GeofenceEventKind::Enter);

        let left = pipeline.evaluate(&location(37.5665, 126.9780)).await.unwrap();
        assert_eq!(left.transitions[0].kind, GeofenceEventKind::Exit);

        let alerts = store.recent_alerts(&owner, 10).await.unwrap();
        let severities: Vec<Severity> = alerts.iter().map(|a| a.severity).collect();
        assert_eq!(severities, vec![Severity::Warning, Severity::Info]);
    }

    #[tokio::test]
    async fn test_workers_drain_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        store.add_geofence(circle("G1", 37.5700, 126.9790, 200.0)).await;
        let pipeline = Arc::new(pipeline_with(store.clone(), Arc::new(MemoryCache::new())).await);
        let config = GeofenceConfig {
            state_ttl: STATE_TTL,
            workers: 3,
            queue_capacity: 16,
        };

        let workers = GeofenceWorkers::spawn(pipeline, &config);
        workers.submit(location(37.5665, 126.9780));
        workers.submit(location(37.5700, 126.9790));
        workers.submit(location(37.5665, 126.9780));
        workers.shutdown().await;

        let events = store.recent_geofence_events(&vehicle(), 10).await.unwrap();
        let kinds: Vec<GeofenceEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![GeofenceEventKind::Exit, GeofenceEventKind::Enter]);
    }
}
