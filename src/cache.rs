use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::RiverResult;

/// Tenant-scoped key/value cache.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, appid: &str, key: &str) -> RiverResult<Option<Value>>;

    async fn put(&self, appid: &str, key: &str, value: Value) -> RiverResult<()>;

    async fn put_with_ttl(&self, appid: &str, key: &str, value: Value, ttl: Duration) -> RiverResult<()>;

    async fn remove(&self, appid: &str, key: &str) -> RiverResult<()>;

    async fn remove_all(&self, appid: &str, keys: &[String]) -> RiverResult<()> {
        for key in keys {
            self.remove(appid, key).await?;
        }
        Ok(())
    }

    async fn contains(&self, appid: &str, key: &str) -> RiverResult<bool> {
        Ok(self.get(appid, key).await?.is_some())
    }
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// In-memory cache. Expired entries are dropped lazily on access.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<(String, String), Entry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, appid: &str, key: &str) -> RiverResult<Option<Value>> {
        let mut guard = self.entries.lock().await;
        let slot = (appid.to_string(), key.to_string());
        let live = guard.get(&slot).map(|entry| entry.is_live(Instant::now()));
        match live {
            Some(true) => Ok(guard.get(&slot).map(|entry| entry.value.clone())),
            Some(false) => {
                guard.remove(&slot);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, appid: &str, key: &str, value: Value) -> RiverResult<()> {
        self.entries.lock().await.insert(
            (appid.to_string(), key.to_string()),
            Entry { value, expires_at: None },
        );
        Ok(())
    }

    async fn put_with_ttl(&self, appid: &str, key: &str, value: Value, ttl: Duration) -> RiverResult<()> {
        self.entries.lock().await.insert(
            (appid.to_string(), key.to_string()),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn remove(&self, appid: &str, key: &str) -> RiverResult<()> {
        self.entries
            .lock()
            .await
            .remove(&(appid.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn entries_are_scoped_by_app() {
        let cache = InMemoryCache::new();
        cache.put("app1", "k", json!(1)).await.unwrap();
        assert_eq!(cache.get("app1", "k").await.unwrap(), Some(json!(1)));
        assert_eq!(cache.get("app2", "k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let cache = InMemoryCache::new();
        cache
            .put_with_ttl("app1", "k", json!("v"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(cache.contains("app1", "k").await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!cache.contains("app1", "k").await.unwrap());
    }

    #[tokio::test]
    async fn remove_all_clears_keys() {
        let cache = InMemoryCache::new();
        cache.put("app1", "a", json!(1)).await.unwrap();
        cache.put("app1", "b", json!(2)).await.unwrap();
        cache
            .remove_all("app1", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(!cache.contains("app1", "a").await.unwrap());
        assert!(!cache.contains("app1", "b").await.unwrap());
    }
}
