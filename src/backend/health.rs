//! TTL-bounded health cache over backend probes.
//!
//! A probe runs only when the cached entry is missing or older than 30 s,
//! and concurrent probes for the same backend coalesce into one in-flight
//! probe. Health results never touch metric history.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::debug;

use super::BackendAdapter;

/// Age beyond which a cached health result is stale.
pub const HEALTH_TTL_SECS: i64 = 30;

/// Cached probe result for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthEntry {
    pub healthy: bool,
    pub at: DateTime<Utc>,
}

impl HealthEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.at < Duration::seconds(HEALTH_TTL_SECS)
    }
}

/// Process-wide health cache keyed by backend id.
#[derive(Default)]
pub struct HealthCache {
    entries: RwLock<HashMap<String, HealthEntry>>,
    /// One async mutex per backend serializes probes for that backend.
    probe_guards: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl HealthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `adapter` is healthy, probing only if the cache is stale.
    pub async fn healthy(&self, adapter: &dyn BackendAdapter) -> bool {
        let now = Utc::now();
        if let Some(entry) = self.entries.read().await.get(adapter.id()) {
            if entry.is_fresh(now) {
                return entry.healthy;
            }
        }

        let guard = self.guard_for(adapter.id());
        let _held = guard.lock().await;

        // Another task may have probed while we waited on the guard.
        let now = Utc::now();
        if let Some(entry) = self.entries.read().await.get(adapter.id()) {
            if entry.is_fresh(now) {
                return entry.healthy;
            }
        }

        let healthy = adapter.health().await;
        debug!(backend = adapter.id(), healthy, "health probe");
        self.entries.write().await.insert(
            adapter.id().to_string(),
            HealthEntry {
                healthy,
                at: Utc::now(),
            },
        );
        healthy
    }

    /// Record a backend as unavailable until the next probe window.
    ///
    /// Used when a connection is refused mid-request, outside the probe path.
    pub async fn mark_unhealthy(&self, backend_id: &str) {
        self.entries.write().await.insert(
            backend_id.to_string(),
            HealthEntry {
                healthy: false,
                at: Utc::now(),
            },
        );
    }

    /// Current cached entry, if any.
    pub async fn entry(&self, backend_id: &str) -> Option<HealthEntry> {
        self.entries.read().await.get(backend_id).copied()
    }

    fn guard_for(&self, backend_id: &str) -> Arc<AsyncMutex<()>> {
        let mut guards = self.probe_guards.lock().expect("health guard lock poisoned");
        guards
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::MockAdapter;
    use crate::backend::BackendTier;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_probe_cached_within_ttl() {
        let adapter = MockAdapter::new("speed", BackendTier::Speed, "hi");
        let cache = HealthCache::new();

        assert!(cache.healthy(&adapter).await);
        let probes_after_first = adapter.health_calls.load(Ordering::SeqCst);

        // Flipping the adapter unhealthy is invisible until the TTL lapses.
        adapter.healthy.store(false, Ordering::SeqCst);
        assert!(cache.healthy(&adapter).await);
        assert_eq!(adapter.health_calls.load(Ordering::SeqCst), probes_after_first);
    }

    #[tokio::test]
    async fn test_mark_unhealthy_sticks_until_expiry() {
        let adapter = MockAdapter::new("speed", BackendTier::Speed, "hi");
        let cache = HealthCache::new();

        cache.mark_unhealthy("speed").await;
        assert!(!cache.healthy(&adapter).await);

        let entry = cache.entry("speed").await.unwrap();
        assert!(!entry.healthy);
    }

    #[tokio::test]
    async fn test_concurrent_probes_coalesce() {
        let adapter = Arc::new(
            MockAdapter::new("speed", BackendTier::Speed, "hi")
                .with_delay(std::time::Duration::from_millis(20)),
        );
        let cache = Arc::new(HealthCache::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let adapter = adapter.clone();
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.healthy(adapter.as_ref()).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        // Eight concurrent callers share one probe.
        assert_eq!(adapter.health_calls.load(Ordering::SeqCst), 1);
    }
}
