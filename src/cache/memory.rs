use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::KeyValueCache;
use crate::errors::TrackerError;

/// In-process TTL cache.
///
/// Expired entries are dropped lazily when read, and swept on writes once
/// the map grows past its last high-water mark.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<Entries>,
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, (String, Instant)>,
    sweep_at: usize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Entries>, TrackerError> {
        self.entries
            .lock()
            .map_err(|_| TrackerError::Cache("memory cache lock poisoned".to_string()))
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, TrackerError> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let expired = match entries.map.get(key) {
            Some((value, expires_at)) if *expires_at > now => return Ok(Some(value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.map.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), TrackerError> {
        let now = Instant::now();
        let mut entries = self.lock()?;

        if entries.map.len() >= entries.sweep_at {
            entries.map.retain(|_, (_, expires_at)| *expires_at > now);
            entries.sweep_at = (entries.map.len() * 2).max(1024);
        }

        entries
            .map
            .insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TrackerError> {
        self.lock()?.map.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), TrackerError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_refreshes_value() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "old", Duration::from_secs(60)).await.unwrap();
        cache.set_ex("k", "new", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("new".to_string()));
    }
}
