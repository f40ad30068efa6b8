//! Hybrid router: complexity-driven backend tier selection.
//!
//! A task's complexity score is compared against thresholds that shift
//! with observed tier performance; live load can override the pick. Every
//! completed task feeds back into the performance store, so the next
//! decision for the same task kind sees the updated history.

mod cache;

pub use cache::{DecisionCache, Fingerprint};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::BackendTier;
use crate::complexity::{
    AnalysisContext, ComplexityAnalyzer, ComplexityMetrics, TaskKind,
};
use crate::error::Result;
use crate::lru::CacheStats;
use crate::metrics::{PerformanceSample, PerformanceStore};

/// Default low-complexity threshold.
const LOW_THRESHOLD: f64 = 0.30;
/// Default high-complexity threshold.
const HIGH_THRESHOLD: f64 = 0.70;
/// Confidence floor after load-driven switches.
const CONFIDENCE_FLOOR: f64 = 0.30;
/// Escalation threshold handed to hybrid decisions.
const DEFAULT_ESCALATION_THRESHOLD: f64 = 0.6;

/// Which execution path a decision selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTier {
    Speed,
    Quality,
    /// Start on the speed tier, escalate to quality below the
    /// escalation threshold
    Hybrid,
}

impl RouteTier {
    /// Backend tier the request starts on.
    pub fn primary(&self) -> BackendTier {
        match self {
            Self::Speed | Self::Hybrid => BackendTier::Speed,
            Self::Quality => BackendTier::Quality,
        }
    }
}

impl std::fmt::Display for RouteTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Speed => write!(f, "speed"),
            Self::Quality => write!(f, "quality"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// A routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub selected: RouteTier,
    /// Confidence in the selection [0,1]
    pub confidence: f64,
    pub reasoning: String,
    /// What to do if the selected path fails
    pub fallback_strategy: String,
    pub estimated_response_time_ms: u64,
    /// Hybrid only: escalate when generation confidence drops below this
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_threshold: Option<f64>,
    /// Complexity score behind the decision
    pub complexity: f64,
    pub decided_at: DateTime<Utc>,
}

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Bypass selection entirely and always pick this tier
    pub forced_tier: Option<RouteTier>,
    /// Concurrency capacity of the speed tier
    pub speed_capacity: u32,
    /// Concurrency capacity of the quality tier
    pub quality_capacity: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            forced_tier: None,
            speed_capacity: 3,
            quality_capacity: 2,
        }
    }
}

/// Live thresholds derived from tier history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub low: f64,
    pub high: f64,
}

/// The hybrid router.
pub struct HybridRouter {
    analyzer: ComplexityAnalyzer,
    cache: DecisionCache,
    store: Arc<PerformanceStore>,
    config: RouterConfig,
    speed_load: AtomicU32,
    quality_load: AtomicU32,
}

impl HybridRouter {
    pub fn new(store: Arc<PerformanceStore>, config: RouterConfig) -> Self {
        Self {
            analyzer: ComplexityAnalyzer::new(),
            cache: DecisionCache::new(),
            store,
            config,
            speed_load: AtomicU32::new(0),
            quality_load: AtomicU32::new(0),
        }
    }

    /// Route a task to a tier. Never fails: any internal error falls back
    /// to a fixed quality-tier decision.
    pub fn route_task(
        &self,
        kind: TaskKind,
        prompt: &str,
        metrics: &ComplexityMetrics,
    ) -> RoutingDecision {
        let fingerprint = Fingerprint::of(kind, prompt, metrics);
        if let Some(cached) = self.cache.get(&fingerprint) {
            debug!(%fingerprint, "routing cache hit");
            return cached;
        }

        let decision = self
            .decide(kind, prompt, metrics)
            .unwrap_or_else(|err| {
                warn!(error = %err, "routing failed; using failsafe decision");
                Self::failsafe()
            });

        self.cache.insert(fingerprint, decision.clone());
        decision
    }

    /// The fixed decision used when decision making itself fails.
    pub fn failsafe() -> RoutingDecision {
        RoutingDecision {
            selected: RouteTier::Quality,
            confidence: 0.5,
            reasoning: "failsafe: decision error, defaulting to quality tier".to_string(),
            fallback_strategy: "retry with backoff".to_string(),
            estimated_response_time_ms: 20_000,
            escalation_threshold: None,
            complexity: 0.5,
            decided_at: Utc::now(),
        }
    }

    fn decide(
        &self,
        kind: TaskKind,
        prompt: &str,
        metrics: &ComplexityMetrics,
    ) -> Result<RoutingDecision> {
        let speed_load = self.speed_load.load(Ordering::Relaxed);
        let quality_load = self.quality_load.load(Ordering::Relaxed);

        let speed_success = self
            .store
            .success_rate_on_kind(BackendTier::Speed, kind)
            .unwrap_or_else(|| self.store.success_rate(BackendTier::Speed));
        let quality_success = self
            .store
            .success_rate_on_kind(BackendTier::Quality, kind)
            .unwrap_or_else(|| self.store.success_rate(BackendTier::Quality));

        let ctx = AnalysisContext {
            hour_of_day: None,
            speed_success_on_kind: self.store.success_rate_on_kind(BackendTier::Speed, kind),
            speed_load,
            quality_load,
        };
        let assessment = self.analyzer.analyze(kind, prompt, metrics, &ctx);
        let complexity = assessment.score;

        let thresholds = self.thresholds(kind);
        let mut reasoning = vec![format!(
            "complexity={:.2} thresholds=[{:.2},{:.2}]",
            complexity, thresholds.low, thresholds.high
        )];

        let (mut selected, mut confidence): (RouteTier, f64) = if let Some(forced) = self.config.forced_tier {
            reasoning.push(format!("forced default tier {}", forced));
            (forced, 0.90)
        } else if complexity < thresholds.low {
            let confidence = if speed_success > 0.8 { 0.95 } else { 0.70 };
            reasoning.push(format!(
                "below low threshold; speed tier (success {:.2})",
                speed_success
            ));
            (RouteTier::Speed, confidence)
        } else if complexity > thresholds.high {
            let confidence = if quality_success > 0.8 { 0.95 } else { 0.80 };
            reasoning.push(format!(
                "above high threshold; quality tier (success {:.2})",
                quality_success
            ));
            (RouteTier::Quality, confidence)
        } else {
            // Mid band: lean on live load, then history.
            let speed_ratio = speed_load as f64 / self.config.speed_capacity.max(1) as f64;
            let quality_ratio = quality_load as f64 / self.config.quality_capacity.max(1) as f64;
            let (lower_tier, lower_success) = if speed_ratio <= quality_ratio {
                (RouteTier::Speed, speed_success)
            } else {
                (RouteTier::Quality, quality_success)
            };

            if lower_success > 0.75 {
                reasoning.push(format!(
                    "mid band; lower-load tier {} (load {:.2} vs {:.2})",
                    lower_tier, speed_ratio, quality_ratio
                ));
                (lower_tier, 0.75)
            } else {
                reasoning.push("mid band; hybrid with escalation".to_string());
                (RouteTier::Hybrid, 0.65)
            }
        };

        // Load adjustment: an overloaded pick moves to the other tier.
        let (primary_load, primary_cap, other_load, other_cap) =
            match selected.primary() {
                BackendTier::Speed => (
                    speed_load,
                    self.config.speed_capacity,
                    quality_load,
                    self.config.quality_capacity,
                ),
                BackendTier::Quality => (
                    quality_load,
                    self.config.quality_capacity,
                    speed_load,
                    self.config.speed_capacity,
                ),
            };
        if primary_load >= primary_cap && other_load < other_cap {
            let switched = match selected.primary() {
                BackendTier::Speed => RouteTier::Quality,
                BackendTier::Quality => RouteTier::Speed,
            };
            reasoning.push(format!(
                "{} tier overloaded ({}/{}); switching to {}",
                selected.primary(),
                primary_load,
                primary_cap,
                switched
            ));
            selected = switched;
            confidence = (confidence - 0.20).max(CONFIDENCE_FLOOR);
        }

        let escalation_threshold = match selected {
            RouteTier::Hybrid => Some(DEFAULT_ESCALATION_THRESHOLD),
            _ => None,
        };

        Ok(RoutingDecision {
            selected,
            confidence,
            reasoning: reasoning.join("; "),
            fallback_strategy: match selected {
                RouteTier::Speed => "escalate to quality tier on failure".to_string(),
                RouteTier::Quality => "retry with backoff".to_string(),
                RouteTier::Hybrid => "escalate below the confidence threshold".to_string(),
            },
            estimated_response_time_ms: self.estimate_time(selected),
            escalation_threshold,
            complexity,
            decided_at: Utc::now(),
        })
    }

    /// Thresholds derived from tier history for this task kind.
    pub fn thresholds(&self, kind: TaskKind) -> Thresholds {
        let speed_success = self
            .store
            .success_rate_on_kind(BackendTier::Speed, kind)
            .unwrap_or_else(|| self.store.success_rate(BackendTier::Speed));
        let speed_latency = self.store.avg_latency_ms(BackendTier::Speed);
        let quality_success = self
            .store
            .success_rate_on_kind(BackendTier::Quality, kind)
            .unwrap_or_else(|| self.store.success_rate(BackendTier::Quality));

        let mut low = LOW_THRESHOLD;
        if speed_success > 0.9 && speed_latency.is_some_and(|l| l < 5_000.0) {
            low = 0.35;
        } else if speed_success < 0.7 {
            low = 0.25;
        }

        let mut high = HIGH_THRESHOLD;
        if quality_success > 0.95 {
            high = 0.60;
        } else if quality_success < 0.8 {
            high = 0.75;
        }

        Thresholds { low, high }
    }

    fn estimate_time(&self, tier: RouteTier) -> u64 {
        let speed = self
            .store
            .avg_latency_ms(BackendTier::Speed)
            .unwrap_or(3_000.0) as u64;
        let quality = self
            .store
            .avg_latency_ms(BackendTier::Quality)
            .unwrap_or(15_000.0) as u64;
        match tier {
            RouteTier::Speed => speed,
            RouteTier::Quality => quality,
            // Worst case: a speed attempt followed by escalation.
            RouteTier::Hybrid => speed + quality,
        }
    }

    /// Record a terminal outcome into the learning loop.
    pub fn record_performance(&self, tier: BackendTier, sample: PerformanceSample) {
        self.store.record(tier, sample);
    }

    /// Mark a request in flight on a tier; returns a guard that releases
    /// the slot on drop.
    pub fn acquire_slot(&self, tier: BackendTier) -> LoadSlot<'_> {
        self.load_counter(tier).fetch_add(1, Ordering::Relaxed);
        LoadSlot { router: self, tier }
    }

    /// Current in-flight count for a tier.
    pub fn load(&self, tier: BackendTier) -> u32 {
        self.load_counter(tier).load(Ordering::Relaxed)
    }

    /// Cache hit statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn load_counter(&self, tier: BackendTier) -> &AtomicU32 {
        match tier {
            BackendTier::Speed => &self.speed_load,
            BackendTier::Quality => &self.quality_load,
        }
    }
}

/// RAII guard for a tier load slot.
pub struct LoadSlot<'a> {
    router: &'a HybridRouter,
    tier: BackendTier,
}

impl Drop for LoadSlot<'_> {
    fn drop(&mut self) {
        self.router
            .load_counter(self.tier)
            .fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::metrics::PerformanceSample;
    use pretty_assertions::assert_eq;

    fn router() -> HybridRouter {
        HybridRouter::new(Arc::new(PerformanceStore::new()), RouterConfig::default())
    }

    #[test]
    fn test_trivial_template_routes_to_speed_with_high_confidence() {
        let decision = router().route_task(
            TaskKind::Template,
            "format this JSON",
            &ComplexityMetrics::default(),
        );
        assert_eq!(decision.selected, RouteTier::Speed);
        assert!(decision.confidence >= 0.9, "confidence {}", decision.confidence);
    }

    #[test]
    fn test_security_architecture_routes_to_quality() {
        let decision = router().route_task(
            TaskKind::Architecture,
            "Design a secure authentication flow with token rotation",
            &ComplexityMetrics::default(),
        );
        assert_eq!(decision.selected, RouteTier::Quality);
        assert!(decision.confidence >= 0.8);
        assert!(decision.complexity >= 0.85);
    }

    #[test]
    fn test_decision_cached_and_idempotent() {
        let router = router();
        let first = router.route_task(
            TaskKind::Review,
            "review this change",
            &ComplexityMetrics::default(),
        );
        let second = router.route_task(
            TaskKind::Review,
            "review this change",
            &ComplexityMetrics::default(),
        );
        assert_eq!(first, second);

        let stats = router.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_overloaded_speed_switches_to_quality() {
        let router = router();
        let _slots: Vec<_> = (0..3)
            .map(|_| router.acquire_slot(BackendTier::Speed))
            .collect();

        let decision = router.route_task(
            TaskKind::Template,
            "format this JSON quickly",
            &ComplexityMetrics::default(),
        );
        assert_eq!(decision.selected, RouteTier::Quality);
        // 0.95 base minus the 0.20 switch penalty.
        assert!((decision.confidence - 0.75).abs() < 1e-9);
        assert!(decision.reasoning.contains("overloaded"));
    }

    #[test]
    fn test_confidence_floor_on_switch() {
        let store = Arc::new(PerformanceStore::new());
        // Degrade speed history so the base confidence is already low.
        for _ in 0..10 {
            store.record(
                BackendTier::Speed,
                PerformanceSample::failure(TaskKind::Template, 900, ErrorKind::Timeout),
            );
        }
        let router = HybridRouter::new(store, RouterConfig::default());
        let _slots: Vec<_> = (0..3)
            .map(|_| router.acquire_slot(BackendTier::Speed))
            .collect();

        let decision = router.route_task(
            TaskKind::Template,
            "format",
            &ComplexityMetrics::default(),
        );
        assert!(decision.confidence >= CONFIDENCE_FLOOR);
    }

    #[test]
    fn test_learning_shift_lowers_low_threshold() {
        let store = Arc::new(PerformanceStore::new());
        let router = HybridRouter::new(store.clone(), RouterConfig::default());

        assert_eq!(router.thresholds(TaskKind::Analysis).low, LOW_THRESHOLD);

        // Twenty failures push speed success on analysis below 0.7.
        for _ in 0..20 {
            router.record_performance(
                BackendTier::Speed,
                PerformanceSample::failure(TaskKind::Analysis, 2_000, ErrorKind::Timeout),
            );
        }

        assert_eq!(router.thresholds(TaskKind::Analysis).low, 0.25);
    }

    #[test]
    fn test_strong_speed_history_raises_low_threshold() {
        let store = Arc::new(PerformanceStore::new());
        for _ in 0..20 {
            store.record(
                BackendTier::Speed,
                PerformanceSample::success(TaskKind::Edit, 800),
            );
        }
        let router = HybridRouter::new(store, RouterConfig::default());
        assert_eq!(router.thresholds(TaskKind::Edit).low, 0.35);
    }

    #[test]
    fn test_weak_quality_history_raises_high_threshold() {
        let store = Arc::new(PerformanceStore::new());
        for i in 0..10 {
            if i < 5 {
                store.record(
                    BackendTier::Quality,
                    PerformanceSample::success(TaskKind::Analysis, 9_000),
                );
            } else {
                store.record(
                    BackendTier::Quality,
                    PerformanceSample::failure(TaskKind::Analysis, 9_000, ErrorKind::Network),
                );
            }
        }
        let router = HybridRouter::new(store, RouterConfig::default());
        assert_eq!(router.thresholds(TaskKind::Analysis).high, 0.75);
    }

    #[test]
    fn test_forced_tier_bypasses_selection() {
        let router = HybridRouter::new(
            Arc::new(PerformanceStore::new()),
            RouterConfig {
                forced_tier: Some(RouteTier::Quality),
                ..Default::default()
            },
        );
        let decision = router.route_task(
            TaskKind::Template,
            "trivial",
            &ComplexityMetrics::default(),
        );
        assert_eq!(decision.selected, RouteTier::Quality);
        assert!((decision.confidence - 0.90).abs() < 1e-9);
    }

    #[test]
    fn test_failsafe_shape() {
        let decision = HybridRouter::failsafe();
        assert_eq!(decision.selected, RouteTier::Quality);
        assert_eq!(decision.confidence, 0.5);
        assert_eq!(decision.estimated_response_time_ms, 20_000);
    }

    #[test]
    fn test_load_slots_release_on_drop() {
        let router = router();
        {
            let _slot = router.acquire_slot(BackendTier::Quality);
            assert_eq!(router.load(BackendTier::Quality), 1);
        }
        assert_eq!(router.load(BackendTier::Quality), 0);
    }

    #[test]
    fn test_hybrid_midband_when_history_is_poor() {
        let store = Arc::new(PerformanceStore::new());
        // Both tiers unreliable on this kind: mid band goes hybrid.
        for _ in 0..10 {
            store.record(
                BackendTier::Speed,
                PerformanceSample::failure(TaskKind::Review, 2_000, ErrorKind::Timeout),
            );
            store.record(
                BackendTier::Quality,
                PerformanceSample::failure(TaskKind::Review, 8_000, ErrorKind::Timeout),
            );
        }
        let router = HybridRouter::new(store, RouterConfig::default());
        let decision = router.route_task(
            TaskKind::Review,
            "review the change",
            &ComplexityMetrics::default(),
        );
        assert_eq!(decision.selected, RouteTier::Hybrid);
        assert_eq!(decision.escalation_threshold, Some(DEFAULT_ESCALATION_THRESHOLD));
    }
}
