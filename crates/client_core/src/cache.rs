//! Response cache keyed by action name and canonical payload.

use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;

#[derive(Debug, Clone)]
pub(crate) struct ResponseCache {
    inner: Cache<String, Value>,
}

impl ResponseCache {
    pub(crate) fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Object keys serialize sorted, so equal payloads share a key regardless
    /// of the order they were built in.
    pub(crate) fn key(action: &str, payload: &Value) -> String {
        format!("{action}\u{0}{payload}")
    }

    pub(crate) async fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key).await
    }

    pub(crate) async fn insert(&self, key: String, data: Value) {
        self.inner.insert(key, data).await;
    }

    pub(crate) fn clear(&self) {
        self.inner.invalidate_all();
    }
}
