//! Vehicle tracking daemon

use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn};

use vehicle_tracker::{
    broadcast::Publisher,
    cache::{KeyValueCache, MemoryCache, RedisCache},
    config::{AppConfig, CacheConfig},
    database::Database,
    errors::TrackerError,
    ingest::IngestWorkers,
    mqtt::{MqttClient, MqttClientBuilder},
    Tracker,
};

#[tokio::main]
async fn main() -> Result<(), TrackerError> {
    #[cfg(feature = "dotenvy")]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration, preferring environment variables and config files
    let config = AppConfig::load()?;
    config.validate()?;

    let db = Arc::new(Database::connect(&config.database).await?);
    let cache = connect_cache(&config.cache).await;

    let mqtt_client = MqttClientBuilder::new(&config.mqtt)?
        .connect(&config.mqtt.topics)
        .await?;

    let mqtt_publisher: Arc<dyn Publisher> =
        Arc::new(mqtt_client.publisher(&config.broadcast.topic_prefix));

    let tracker = Arc::new(Tracker::new(
        db.clone(),
        cache,
        vec![mqtt_publisher],
        config.cache.location_ttl,
        &config.geofence,
    ));

    let health = tracker.health().await;
    info!("Vehicle tracker started: {:?}", health);

    let workers = IngestWorkers::spawn(tracker.clone(), &config.ingest);

    // Setup signal handling for graceful shutdown
    let shutdown_signal = signal::ctrl_c();

    tokio::select! {
        _ = run_tracker(mqtt_client, &workers) => {
            info!("Report stream ended");
        }
        _ = shutdown_signal => {
            info!("Received shutdown signal");
        }
    }

    workers.shutdown().await;
    match Arc::try_unwrap(tracker) {
        Ok(tracker) => tracker.shutdown().await,
        Err(_) => warn!("Tracker still shared, skipping geofence drain"),
    }
    db.close().await;

    Ok(())
}

/// Redis when configured and reachable, otherwise an in-process cache.
async fn connect_cache(config: &CacheConfig) -> Arc<dyn KeyValueCache> {
    if let Some(url) = &config.redis_url {
        match RedisCache::connect(url).await {
            Ok(cache) => return Arc::new(cache),
            Err(e) => warn!("Redis unavailable, using in-process cache: {}", e),
        }
    }
    Arc::new(MemoryCache::new())
}

async fn run_tracker(mut mqtt_client: MqttClient, workers: &IngestWorkers) {
    let mut received: u64 = 0;

    while let Some(report) = mqtt_client.recv().await {
        match report {
            Ok(report) => workers.submit(report).await,
            Err(e) => workers.reject(&e),
        }

        received += 1;
        if received % 10_000 == 0 {
            let stats = workers.stats();
            info!(
                "Reports accepted: {}, rejected: {}, failed: {}",
                stats.accepted(),
                stats.rejected(),
                stats.failed()
            );
        }
    }
}
