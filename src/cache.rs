use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// In-process fallback cache for served payloads.
///
/// Constructed once in `main` and handed to the serve layer; entries expire
/// after the configured TTL. This is the last resort when the durable store
/// cannot be read mid-request, not a substitute for it.
#[derive(Clone)]
pub struct PayloadCache<T> {
    inner: Arc<PayloadCacheInner<T>>,
}

struct PayloadCacheInner<T> {
    ttl: Duration,
    entries: RwLock<HashMap<String, (DateTime<Utc>, T)>>,
}

impl<T: Clone> PayloadCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(PayloadCacheInner {
                ttl,
                entries: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub async fn put(&self, key: impl Into<String>, value: T) {
        let mut guard = self.inner.entries.write().await;
        guard.insert(key.into(), (Utc::now(), value));
    }

    /// Returns the cached value if it has not outlived the TTL.
    pub async fn get(&self, key: &str) -> Option<T> {
        let ttl = chrono::Duration::from_std(self.inner.ttl).ok()?;
        let guard = self.inner.entries.read().await;
        let (stored_at, value) = guard.get(key)?;
        if Utc::now().signed_duration_since(*stored_at) > ttl {
            return None;
        }
        Some(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_round_trip_within_ttl() {
        let cache = PayloadCache::new(Duration::from_secs(60));
        cache.put("country:VE", 42u32).await;
        assert_eq!(cache.get("country:VE").await, Some(42));
        assert_eq!(cache.get("country:AR").await, None);
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let cache = PayloadCache::new(Duration::from_secs(0));
        cache.put("k", 1u32).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k").await, None);
    }
}
