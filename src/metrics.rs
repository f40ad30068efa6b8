//! Sliding-window performance metrics.
//!
//! Samples are kept in ring buffers of at most 100 entries per
//! (tier, outcome) key; older samples drop on overflow. Every terminal
//! request outcome is recorded here regardless of success, and the router
//! reads the same store to shift its thresholds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::backend::BackendTier;
use crate::complexity::TaskKind;
use crate::error::ErrorKind;
use crate::voice::VoiceId;

/// Maximum samples retained per (tier, outcome) key.
pub const RING_CAPACITY: usize = 100;

/// Success/failure axis of the ring-buffer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    Success,
    Failure,
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// Task classification of the invocation
    pub task_kind: TaskKind,
    /// Voice that drove the invocation, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceId>,
    /// End-to-end latency
    pub latency_ms: u64,
    /// Quality score [0,1], when an audit produced one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    /// Total tokens used
    pub tokens: u64,
    /// Estimated cost in USD
    pub cost_usd: f64,
    /// Error kind for failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// When the sample was recorded
    pub at: DateTime<Utc>,
}

impl PerformanceSample {
    pub fn success(task_kind: TaskKind, latency_ms: u64) -> Self {
        Self {
            task_kind,
            voice: None,
            latency_ms,
            quality: None,
            tokens: 0,
            cost_usd: 0.0,
            error_kind: None,
            at: Utc::now(),
        }
    }

    pub fn failure(task_kind: TaskKind, latency_ms: u64, error_kind: ErrorKind) -> Self {
        Self {
            error_kind: Some(error_kind),
            ..Self::success(task_kind, latency_ms)
        }
    }

    pub fn with_voice(mut self, voice: VoiceId) -> Self {
        self.voice = Some(voice);
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality.clamp(0.0, 1.0));
        self
    }

    pub fn with_usage(mut self, tokens: u64, cost_usd: f64) -> Self {
        self.tokens = tokens;
        self.cost_usd = cost_usd;
        self
    }
}

/// Aggregate view over one tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub successes: usize,
    pub failures: usize,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

impl TierStats {
    pub fn sample_count(&self) -> usize {
        self.successes + self.failures
    }
}

/// Process-wide metric store with bounded history.
#[derive(Debug, Default)]
pub struct PerformanceStore {
    buffers: RwLock<HashMap<(BackendTier, SampleOutcome), VecDeque<PerformanceSample>>>,
}

impl PerformanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample under its (tier, outcome) ring buffer.
    pub fn record(&self, tier: BackendTier, sample: PerformanceSample) {
        let outcome = if sample.error_kind.is_none() {
            SampleOutcome::Success
        } else {
            SampleOutcome::Failure
        };
        let mut buffers = self.buffers.write().expect("metrics lock poisoned");
        let buffer = buffers.entry((tier, outcome)).or_default();
        if buffer.len() == RING_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(sample);
    }

    /// Success rate for a tier across all task kinds.
    ///
    /// With no history the tier is assumed healthy (1.0), so a cold store
    /// never penalizes routing confidence.
    pub fn success_rate(&self, tier: BackendTier) -> f64 {
        let buffers = self.buffers.read().expect("metrics lock poisoned");
        let successes = buffers
            .get(&(tier, SampleOutcome::Success))
            .map_or(0, VecDeque::len);
        let failures = buffers
            .get(&(tier, SampleOutcome::Failure))
            .map_or(0, VecDeque::len);
        let total = successes + failures;
        if total == 0 {
            1.0
        } else {
            successes as f64 / total as f64
        }
    }

    /// Success rate for a tier restricted to one task kind, if any samples
    /// exist for it.
    pub fn success_rate_on_kind(&self, tier: BackendTier, kind: TaskKind) -> Option<f64> {
        let buffers = self.buffers.read().expect("metrics lock poisoned");
        let count = |outcome| {
            buffers
                .get(&(tier, outcome))
                .map_or(0, |b: &VecDeque<PerformanceSample>| {
                    b.iter().filter(|s| s.task_kind == kind).count()
                })
        };
        let successes = count(SampleOutcome::Success);
        let failures = count(SampleOutcome::Failure);
        let total = successes + failures;
        if total == 0 {
            None
        } else {
            Some(successes as f64 / total as f64)
        }
    }

    /// Average latency across successful samples for a tier.
    pub fn avg_latency_ms(&self, tier: BackendTier) -> Option<f64> {
        let buffers = self.buffers.read().expect("metrics lock poisoned");
        let buffer = buffers.get(&(tier, SampleOutcome::Success))?;
        if buffer.is_empty() {
            return None;
        }
        let sum: u64 = buffer.iter().map(|s| s.latency_ms).sum();
        Some(sum as f64 / buffer.len() as f64)
    }

    /// Aggregate stats for a tier.
    pub fn tier_stats(&self, tier: BackendTier) -> TierStats {
        let buffers = self.buffers.read().expect("metrics lock poisoned");
        let successes = buffers
            .get(&(tier, SampleOutcome::Success))
            .map_or(0, VecDeque::len);
        let failures = buffers
            .get(&(tier, SampleOutcome::Failure))
            .map_or(0, VecDeque::len);
        let total = successes + failures;

        let mut total_tokens = 0u64;
        let mut total_cost = 0.0f64;
        let mut latency_sum = 0u64;
        for outcome in [SampleOutcome::Success, SampleOutcome::Failure] {
            if let Some(buffer) = buffers.get(&(tier, outcome)) {
                for sample in buffer {
                    total_tokens += sample.tokens;
                    total_cost += sample.cost_usd;
                    if outcome == SampleOutcome::Success {
                        latency_sum += sample.latency_ms;
                    }
                }
            }
        }

        TierStats {
            successes,
            failures,
            success_rate: if total == 0 {
                1.0
            } else {
                successes as f64 / total as f64
            },
            avg_latency_ms: if successes == 0 {
                None
            } else {
                Some(latency_sum as f64 / successes as f64)
            },
            total_tokens,
            total_cost_usd: total_cost,
        }
    }

    /// Number of samples currently retained for a (tier, outcome) key.
    pub fn buffer_len(&self, tier: BackendTier, outcome: SampleOutcome) -> usize {
        let buffers = self.buffers.read().expect("metrics lock poisoned");
        buffers.get(&(tier, outcome)).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cold_store_is_optimistic() {
        let store = PerformanceStore::new();
        assert_eq!(store.success_rate(BackendTier::Speed), 1.0);
        assert!(store.avg_latency_ms(BackendTier::Speed).is_none());
        assert!(store
            .success_rate_on_kind(BackendTier::Speed, TaskKind::Analysis)
            .is_none());
    }

    #[test]
    fn test_success_rate_per_kind() {
        let store = PerformanceStore::new();
        for _ in 0..15 {
            store.record(
                BackendTier::Speed,
                PerformanceSample::failure(TaskKind::Analysis, 900, ErrorKind::Timeout),
            );
        }
        for _ in 0..5 {
            store.record(
                BackendTier::Speed,
                PerformanceSample::success(TaskKind::Analysis, 700),
            );
        }
        store.record(
            BackendTier::Speed,
            PerformanceSample::success(TaskKind::Template, 100),
        );

        let rate = store
            .success_rate_on_kind(BackendTier::Speed, TaskKind::Analysis)
            .unwrap();
        assert!((rate - 0.25).abs() < 1e-9);

        // The template sample is untouched by the analysis slice.
        assert_eq!(
            store.success_rate_on_kind(BackendTier::Speed, TaskKind::Template),
            Some(1.0)
        );
    }

    #[test]
    fn test_tier_stats_aggregation() {
        let store = PerformanceStore::new();
        store.record(
            BackendTier::Quality,
            PerformanceSample::success(TaskKind::Review, 2000).with_usage(500, 0.01),
        );
        store.record(
            BackendTier::Quality,
            PerformanceSample::failure(TaskKind::Review, 5000, ErrorKind::Network)
                .with_usage(100, 0.002),
        );

        let stats = store.tier_stats(BackendTier::Quality);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.avg_latency_ms, Some(2000.0));
        assert_eq!(stats.total_tokens, 600);
    }

    #[test]
    fn test_ring_drops_oldest() {
        let store = PerformanceStore::new();
        for i in 0..150u64 {
            store.record(
                BackendTier::Speed,
                PerformanceSample::success(TaskKind::Edit, i),
            );
        }
        assert_eq!(
            store.buffer_len(BackendTier::Speed, SampleOutcome::Success),
            RING_CAPACITY
        );
        // The retained window is the newest 100 samples.
        let avg = store.avg_latency_ms(BackendTier::Speed).unwrap();
        assert!((avg - 99.5).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_buffer_never_exceeds_capacity(count in 0usize..400) {
            let store = PerformanceStore::new();
            for _ in 0..count {
                store.record(
                    BackendTier::Speed,
                    PerformanceSample::success(TaskKind::Generation, 10),
                );
            }
            prop_assert!(
                store.buffer_len(BackendTier::Speed, SampleOutcome::Success) <= RING_CAPACITY
            );
        }
    }
}
