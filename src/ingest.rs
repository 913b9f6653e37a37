//! Concurrent ingestion of position reports.
//!
//! Reports are sharded by vehicle id over a fixed set of workers. Distinct
//! vehicles are stored in parallel while each vehicle's reports keep their
//! arrival order. Unlike geofence jobs, reports are never dropped: a full
//! shard queue makes [`IngestWorkers::submit`] wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    config::IngestConfig, errors::TrackerError, geofence::shard_index, models::LocationReport,
    tracker::Tracker,
};

/// Running totals of ingestion outcomes.
#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

impl IngestStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Reports refused by validation or parsing.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Reports lost to store failures.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn record(&self, result: &Result<(), TrackerError>) {
        let counter = match result {
            Ok(()) => &self.accepted,
            Err(e) if e.is_persistence() => &self.failed,
            Err(_) => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct IngestWorkers {
    shards: Vec<mpsc::Sender<LocationReport>>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<IngestStats>,
}

impl IngestWorkers {
    pub fn spawn(tracker: Arc<Tracker>, config: &IngestConfig) -> Self {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let stats = Arc::new(IngestStats::default());

        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            shards.push(tx);
            handles.push(tokio::spawn(Self::run(
                shard,
                tracker.clone(),
                stats.clone(),
                rx,
            )));
        }

        info!(
            "Started {} ingest workers, queue capacity {}",
            workers, capacity
        );
        Self {
            shards,
            handles,
            stats,
        }
    }

    /// Shard that handles reports for `vehicle_id`.
    pub fn shard_for(&self, vehicle_id: &str) -> usize {
        shard_index(vehicle_id.trim(), self.shards.len())
    }

    /// Queue a report, waiting while its shard is full.
    pub async fn submit(&self, report: LocationReport) {
        let shard = self.shard_for(report.vehicle_id.as_deref().unwrap_or_default());
        if self.shards[shard].send(report).await.is_err() {
            warn!("Ingest queue {} closed, report dropped", shard);
        }
    }

    /// Count a report that failed before it could be submitted.
    pub fn reject(&self, e: &TrackerError) {
        warn!("Rejected report: {}", e);
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Stop accepting reports and wait for queued ones to be stored.
    pub async fn shutdown(self) -> Arc<IngestStats> {
        drop(self.shards);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Ingest worker ended abnormally: {}", e);
            }
        }
        info!(
            "Ingest workers stopped: {} accepted, {} rejected, {} failed",
            self.stats.accepted(),
            self.stats.rejected(),
            self.stats.failed()
        );
        self.stats
    }

    async fn run(
        shard: usize,
        tracker: Arc<Tracker>,
        stats: Arc<IngestStats>,
        mut rx: mpsc::Receiver<LocationReport>,
    ) {
        while let Some(report) = rx.recv().await {
            let result = tracker.ingest(report).await.map(|location| {
                debug!("Shard {}: stored report for {}", shard, location.vehicle_id);
            });
            match &result {
                Ok(()) => {}
                Err(e) if e.is_persistence() => error!("Failed to store report: {}", e),
                Err(e) => warn!("Rejected report: {}", e),
            }
            stats.record(&result);
        }
    }
}
