//! Routing decision cache.
//!
//! Decisions are cached under a fingerprint of (task kind, prompt prefix,
//! normalized metrics) with a 5-minute TTL and an LRU cap of 1000.
//! Entries past the TTL are invisible to callers even before eviction.

use chrono::Duration;
use sha2::{Digest, Sha256};
use std::sync::RwLock;

use super::RoutingDecision;
use crate::complexity::{ComplexityMetrics, TaskKind};
use crate::lru::{CacheStats, LruTtlCache};

/// Max cached decisions.
const CACHE_CAP: usize = 1000;
/// Decision lifetime.
const CACHE_TTL_SECS: i64 = 300;
/// Prompt prefix length folded into the fingerprint.
const PROMPT_PREFIX_CHARS: usize = 100;

/// Cache key for a routing decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Fingerprint of (task kind, prompt prefix, normalized metrics).
    pub fn of(kind: TaskKind, prompt: &str, metrics: &ComplexityMetrics) -> Self {
        let prefix: String = prompt.chars().take(PROMPT_PREFIX_CHARS).collect();

        let mut hasher = Sha256::new();
        hasher.update(kind.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(prefix.as_bytes());
        hasher.update(b"\n");
        hasher.update(metrics.normalized().as_bytes());
        let hash = hasher.finalize();
        Self(format!("{:x}", hash))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..16])
    }
}

/// TTL+LRU cache over routing decisions with visible hit statistics.
pub struct DecisionCache {
    inner: RwLock<LruTtlCache<Fingerprint, RoutingDecision>>,
}

impl DecisionCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LruTtlCache::new(
                CACHE_CAP,
                Duration::seconds(CACHE_TTL_SECS),
            )),
        }
    }

    pub fn get(&self, key: &Fingerprint) -> Option<RoutingDecision> {
        self.inner
            .write()
            .expect("decision cache lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: Fingerprint, decision: RoutingDecision) {
        self.inner
            .write()
            .expect("decision cache lock poisoned")
            .insert(key, decision);
    }

    pub fn stats(&self) -> CacheStats {
        self.inner
            .read()
            .expect("decision cache lock poisoned")
            .stats()
    }
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_stable_and_prefix_bounded() {
        let metrics = ComplexityMetrics::default();
        let a = Fingerprint::of(TaskKind::Analysis, "analyze this", &metrics);
        let b = Fingerprint::of(TaskKind::Analysis, "analyze this", &metrics);
        assert_eq!(a, b);

        // Divergence past the 100-char prefix does not change the key.
        let long_a = format!("{}{}", "p".repeat(100), "tail one");
        let long_b = format!("{}{}", "p".repeat(100), "different tail");
        assert_eq!(
            Fingerprint::of(TaskKind::Analysis, &long_a, &metrics),
            Fingerprint::of(TaskKind::Analysis, &long_b, &metrics)
        );
    }

    #[test]
    fn test_fingerprint_varies_by_kind_and_metrics() {
        let metrics = ComplexityMetrics::default();
        let a = Fingerprint::of(TaskKind::Analysis, "x", &metrics);
        let b = Fingerprint::of(TaskKind::Template, "x", &metrics);
        assert_ne!(a, b);

        let boosted = ComplexityMetrics {
            security_implications: true,
            ..Default::default()
        };
        assert_ne!(
            Fingerprint::of(TaskKind::Analysis, "x", &metrics),
            Fingerprint::of(TaskKind::Analysis, "x", &boosted)
        );
    }
}
