//! Hierarchical voice memory.
//!
//! Three tiers feed each persona with prior context:
//! - **L1** — per-voice resident context, one per known voice, O(1) access.
//! - **L2** — shared contexts in an LRU map (cap 100, TTL 30 min), keyed
//!   by family or by (task type, sorted voice-id set).
//! - **L3** — long-term collaboration records, bounded at 20 per voice.
//!
//! Collaboration records are shared by every participating voice, so they
//! live once in an arena keyed by record id; voices hold ids, not owning
//! references. A record is dropped when no voice references it anymore.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use super::selector::SnapshotLatency;
use super::types::{VoiceFamily, VoiceId, VoicePerformance, VoiceRegistry};
use crate::lru::LruTtlCache;
use crate::request::TaskType;

/// Newest interactions retained per voice.
const RECENT_CAP: usize = 5;
/// Success patterns retained per voice.
const PATTERN_CAP: usize = 10;
/// Collaboration references surfaced in an L1 context.
const L1_HISTORY_CAP: usize = 5;
/// Collaboration records retained per voice in L3.
const L3_CAP: usize = 20;
/// Collaborations retained in an L2 shared context.
const L2_COLLAB_CAP: usize = 20;
/// Shared contexts retained in L2.
const L2_CAP: usize = 100;
/// L2 entry lifetime.
const L2_TTL_MINUTES: i64 = 30;
/// Quality floor for a record to count as a success pattern.
const SUCCESS_QUALITY_FLOOR: f64 = 0.7;

/// How a collaboration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failure,
}

/// Identifier of a collaboration record in the L3 arena.
pub type RecordId = u64;

/// One collaboration between voices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationRecord {
    pub at: DateTime<Utc>,
    pub voices: Vec<VoiceId>,
    pub task_type: TaskType,
    pub outcome: Outcome,
    /// Quality score [0,1]
    pub quality: f64,
    pub tokens: u64,
    pub duration_ms: u64,
}

/// Measured outcome of a collaboration, fed back into memory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollaborationMetrics {
    pub quality: f64,
    pub tokens: u64,
    pub duration_ms: u64,
    pub cost_usd: f64,
}

/// L1: per-voice resident context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceContext {
    pub voice_id: VoiceId,
    /// Newest first, cap 5
    pub recent_interactions: VecDeque<String>,
    pub specialization: Vec<String>,
    /// Cap 10
    pub success_patterns: Vec<String>,
    /// Recent collaboration record ids, cap 5
    pub collaboration_history: Vec<RecordId>,
    pub performance: VoicePerformance,
}

impl VoiceContext {
    fn new(voice_id: VoiceId, specialization: Vec<String>) -> Self {
        Self {
            voice_id,
            recent_interactions: VecDeque::new(),
            specialization,
            success_patterns: Vec::new(),
            collaboration_history: Vec::new(),
            performance: VoicePerformance::default(),
        }
    }

    /// Context quality heuristic: richer contexts score closer to 1.0.
    pub fn quality(&self) -> f64 {
        let mut q = 0.5;
        if !self.recent_interactions.is_empty() {
            q += 0.1;
        }
        if !self.success_patterns.is_empty() {
            q += 0.2;
        }
        if !self.collaboration_history.is_empty() {
            q += 0.1;
        }
        q += 0.1 * self.performance.success_rate;
        q.min(1.0)
    }
}

/// L2: context shared across a family or a recurring voice set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    pub task_domain: String,
    /// Record ids, newest last, cap 20
    pub recent_collaborations: Vec<RecordId>,
    pub common_patterns: Vec<String>,
    pub cross_voice_insights: Vec<String>,
}

impl SharedContext {
    fn new(task_domain: impl Into<String>) -> Self {
        Self {
            task_domain: task_domain.into(),
            recent_collaborations: Vec::new(),
            common_patterns: Vec::new(),
            cross_voice_insights: Vec::new(),
        }
    }
}

/// A memory lookup for one voice.
#[derive(Debug, Clone)]
pub struct VoiceQuery {
    pub voice_id: VoiceId,
    /// Current prompt, prepended to recent interactions
    pub prompt: Option<String>,
    /// Restrict L3 synthesis to one task type
    pub task_type: Option<TaskType>,
}

impl VoiceQuery {
    pub fn for_voice(voice_id: impl Into<VoiceId>) -> Self {
        Self {
            voice_id: voice_id.into(),
            prompt: None,
            task_type: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }
}

/// Aggregate counts, stable across snapshot round-trips.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub l1_entries: usize,
    pub l2_entries: usize,
    pub l3_records: usize,
    pub collaboration_refs: usize,
}

/// Serializable image of the memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub l1: Vec<VoiceContext>,
    pub l2: Vec<(String, SharedContext)>,
    pub records: Vec<(RecordId, CollaborationRecord)>,
    pub by_voice: Vec<(VoiceId, Vec<RecordId>)>,
    pub next_record_id: RecordId,
}

struct MemoryInner {
    l1: HashMap<VoiceId, VoiceContext>,
    l2: LruTtlCache<String, SharedContext>,
    records: HashMap<RecordId, CollaborationRecord>,
    by_voice: HashMap<VoiceId, VecDeque<RecordId>>,
    next_record_id: RecordId,
}

impl MemoryInner {
    fn l2_key(voices: &[VoiceId], task_type: TaskType) -> String {
        let families: Vec<_> = voices.iter().map(VoiceFamily::of).collect();
        if let [Some(first), rest @ ..] = families.as_slice() {
            if rest.iter().all(|f| f.as_ref() == Some(first)) {
                return format!("family_{}", first);
            }
        }
        let mut ids: Vec<_> = voices.iter().map(|v| v.as_str().to_string()).collect();
        ids.sort();
        format!("{}_{}", task_type, ids.join("+"))
    }

    /// Drop a record when no voice references it anymore.
    fn release_if_orphaned(&mut self, id: RecordId) {
        let referenced = self.by_voice.values().any(|refs| refs.contains(&id));
        if !referenced {
            self.records.remove(&id);
        }
    }
}

/// Process-wide hierarchical voice memory.
pub struct VoiceMemory {
    inner: RwLock<MemoryInner>,
}

impl VoiceMemory {
    /// Create memory with resident L1 contexts for every registered voice.
    pub fn new(registry: &VoiceRegistry) -> Self {
        let l1 = registry
            .ids()
            .map(|id| {
                let specialization = registry
                    .get(id)
                    .map(|p| p.specialization.clone())
                    .unwrap_or_default();
                (id.clone(), VoiceContext::new(id.clone(), specialization))
            })
            .collect();

        Self {
            inner: RwLock::new(MemoryInner {
                l1,
                l2: LruTtlCache::new(L2_CAP, Duration::minutes(L2_TTL_MINUTES)),
                records: HashMap::new(),
                by_voice: HashMap::new(),
                next_record_id: 0,
            }),
        }
    }

    /// Fetch (or synthesize) the context for a voice.
    ///
    /// A present L1 entry is returned directly; otherwise one is built
    /// from the family's L2 context plus successful L3 patterns and
    /// written back. The query prompt lands at the head of the recent
    /// interactions either way.
    pub fn voice_context(&self, query: &VoiceQuery) -> VoiceContext {
        let mut inner = self.inner.write().expect("memory lock poisoned");

        if !inner.l1.contains_key(&query.voice_id) {
            let synthesized = Self::synthesize(&mut inner, query);
            inner.l1.insert(query.voice_id.clone(), synthesized);
        }

        let context = inner
            .l1
            .get_mut(&query.voice_id)
            .expect("inserted above");
        if let Some(prompt) = &query.prompt {
            context.recent_interactions.push_front(prompt.clone());
            context.recent_interactions.truncate(RECENT_CAP);
        }
        context.clone()
    }

    fn synthesize(inner: &mut MemoryInner, query: &VoiceQuery) -> VoiceContext {
        let mut context = VoiceContext::new(query.voice_id.clone(), Vec::new());

        // Family-level shared context seeds the patterns.
        if let Some(family) = VoiceFamily::of(&query.voice_id) {
            let key = format!("family_{}", family);
            if let Some(shared) = inner.l2.get(&key) {
                context.success_patterns = shared.common_patterns.clone();
                context.success_patterns.truncate(PATTERN_CAP);
            }
        }

        // Successful collaborations this voice took part in.
        if let Some(refs) = inner.by_voice.get(&query.voice_id) {
            for id in refs.iter().rev() {
                let Some(record) = inner.records.get(id) else {
                    continue;
                };
                if record.outcome != Outcome::Success || record.quality <= SUCCESS_QUALITY_FLOOR {
                    continue;
                }
                if let Some(task_type) = query.task_type {
                    if record.task_type != task_type {
                        continue;
                    }
                }
                if context.collaboration_history.len() < L1_HISTORY_CAP {
                    context.collaboration_history.push(*id);
                }
                let pattern = format!("{}@{:.2}", record.task_type, record.quality);
                if !context.success_patterns.contains(&pattern)
                    && context.success_patterns.len() < PATTERN_CAP
                {
                    context.success_patterns.push(pattern);
                }
            }
        }

        context
    }

    /// Record the outcome of a collaboration.
    ///
    /// Appends to every participant's L3 history (cap 20, FIFO), updates
    /// the matching L2 shared context, and folds the metrics into each
    /// participant's L1 performance record.
    pub fn record_collaboration_outcome(
        &self,
        voices: &[VoiceId],
        task_type: TaskType,
        outcome: Outcome,
        metrics: CollaborationMetrics,
    ) -> RecordId {
        let mut inner = self.inner.write().expect("memory lock poisoned");

        let id = inner.next_record_id;
        inner.next_record_id += 1;
        let record = CollaborationRecord {
            at: Utc::now(),
            voices: voices.to_vec(),
            task_type,
            outcome,
            quality: metrics.quality.clamp(0.0, 1.0),
            tokens: metrics.tokens,
            duration_ms: metrics.duration_ms,
        };
        inner.records.insert(id, record);

        // L3: every participant references the record.
        let mut evicted = Vec::new();
        for voice in voices {
            let refs = inner.by_voice.entry(voice.clone()).or_default();
            refs.push_back(id);
            if refs.len() > L3_CAP {
                if let Some(old) = refs.pop_front() {
                    evicted.push(old);
                }
            }
        }
        for old in evicted {
            inner.release_if_orphaned(old);
        }

        // L2: the matching shared context keeps the last 20 collaborations.
        let key = MemoryInner::l2_key(voices, task_type);
        let pattern = format!("{}@{:.2}", task_type, metrics.quality);
        let mut shared = inner
            .l2
            .get(&key)
            .cloned()
            .unwrap_or_else(|| SharedContext::new(task_type.to_string()));
        shared.recent_collaborations.push(id);
        if shared.recent_collaborations.len() > L2_COLLAB_CAP {
            let overflow = shared.recent_collaborations.len() - L2_COLLAB_CAP;
            shared.recent_collaborations.drain(..overflow);
        }
        if outcome == Outcome::Success
            && metrics.quality > SUCCESS_QUALITY_FLOOR
            && !shared.common_patterns.contains(&pattern)
        {
            shared.common_patterns.push(pattern.clone());
            shared.common_patterns.truncate(PATTERN_CAP);
        }
        inner.l2.insert(key, shared);

        // L1: EMA fold per participant; successes become patterns.
        let success = outcome == Outcome::Success;
        for voice in voices {
            let specialization = Vec::new();
            let context = inner
                .l1
                .entry(voice.clone())
                .or_insert_with(|| VoiceContext::new(voice.clone(), specialization));
            context.performance.fold(
                metrics.quality,
                metrics.duration_ms,
                metrics.tokens,
                success,
                metrics.cost_usd,
            );
            if context.collaboration_history.len() >= L1_HISTORY_CAP {
                context.collaboration_history.remove(0);
            }
            context.collaboration_history.push(id);
            if success
                && metrics.quality > SUCCESS_QUALITY_FLOOR
                && !context.success_patterns.contains(&pattern)
            {
                context.success_patterns.push(pattern.clone());
                context.success_patterns.truncate(PATTERN_CAP);
            }
        }

        id
    }

    /// Fetch a collaboration record by id.
    pub fn record(&self, id: RecordId) -> Option<CollaborationRecord> {
        self.inner
            .read()
            .expect("memory lock poisoned")
            .records
            .get(&id)
            .cloned()
    }

    /// L3 reference list for a voice.
    pub fn history(&self, voice: &VoiceId) -> Vec<RecordId> {
        self.inner
            .read()
            .expect("memory lock poisoned")
            .by_voice
            .get(voice)
            .map(|refs| refs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Aggregate counts.
    pub fn memory_stats(&self) -> MemoryStats {
        let inner = self.inner.read().expect("memory lock poisoned");
        MemoryStats {
            l1_entries: inner.l1.len(),
            l2_entries: inner.l2.live_len(),
            l3_records: inner.records.len(),
            collaboration_refs: inner.by_voice.values().map(VecDeque::len).sum(),
        }
    }

    /// Latency snapshot for the selector's ROI pass.
    pub fn latency_snapshot(&self) -> SnapshotLatency {
        let inner = self.inner.read().expect("memory lock poisoned");
        SnapshotLatency::from_performance(
            inner.l1.iter().map(|(id, ctx)| (id, &ctx.performance)),
        )
    }

    /// Performance record for one voice, if present.
    pub fn performance(&self, voice: &VoiceId) -> Option<VoicePerformance> {
        self.inner
            .read()
            .expect("memory lock poisoned")
            .l1
            .get(voice)
            .map(|c| c.performance.clone())
    }

    /// Serializable image of the current state.
    pub fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.read().expect("memory lock poisoned");
        MemorySnapshot {
            l1: inner.l1.values().cloned().collect(),
            l2: inner
                .l2
                .iter_live()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            records: inner.records.iter().map(|(k, v)| (*k, v.clone())).collect(),
            by_voice: inner
                .by_voice
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
                .collect(),
            next_record_id: inner.next_record_id,
        }
    }

    /// Rebuild memory from a snapshot.
    pub fn restore(snapshot: MemorySnapshot) -> Self {
        let mut l2 = LruTtlCache::new(L2_CAP, Duration::minutes(L2_TTL_MINUTES));
        for (key, shared) in snapshot.l2 {
            l2.insert(key, shared);
        }
        Self {
            inner: RwLock::new(MemoryInner {
                l1: snapshot
                    .l1
                    .into_iter()
                    .map(|c| (c.voice_id.clone(), c))
                    .collect(),
                l2,
                records: snapshot.records.into_iter().collect(),
                by_voice: snapshot
                    .by_voice
                    .into_iter()
                    .map(|(k, v)| (k, v.into_iter().collect()))
                    .collect(),
                next_record_id: snapshot.next_record_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn metrics(quality: f64) -> CollaborationMetrics {
        CollaborationMetrics {
            quality,
            tokens: 400,
            duration_ms: 1_500,
            cost_usd: 0.004,
        }
    }

    fn memory() -> VoiceMemory {
        VoiceMemory::new(&VoiceRegistry::builtin())
    }

    #[test]
    fn test_l1_resident_for_known_voices() {
        let memory = memory();
        assert_eq!(memory.memory_stats().l1_entries, 9);

        let context = memory.voice_context(
            &VoiceQuery::for_voice("developer").with_prompt("build the thing"),
        );
        assert_eq!(context.voice_id, VoiceId::from("developer"));
        assert_eq!(context.recent_interactions[0], "build the thing");
        assert!(!context.specialization.is_empty());
    }

    #[test]
    fn test_recent_interactions_capped_newest_first() {
        let memory = memory();
        for i in 0..8 {
            memory.voice_context(
                &VoiceQuery::for_voice("analyzer").with_prompt(format!("prompt {}", i)),
            );
        }
        let context = memory.voice_context(&VoiceQuery::for_voice("analyzer"));
        assert_eq!(context.recent_interactions.len(), 5);
        assert_eq!(context.recent_interactions[0], "prompt 7");
    }

    #[test]
    fn test_collaboration_referenced_by_all_participants() {
        let memory = memory();
        let voices = [VoiceId::from("architect"), VoiceId::from("security")];
        let id = memory.record_collaboration_outcome(
            &voices,
            TaskType::ArchitectureDesign,
            Outcome::Success,
            metrics(0.9),
        );

        for voice in &voices {
            assert!(memory.history(voice).contains(&id), "{} missing ref", voice);
        }
        let record = memory.record(id).unwrap();
        assert_eq!(record.voices.len(), 2);
    }

    #[test]
    fn test_l3_capped_at_twenty_fifo() {
        let memory = memory();
        let voice = [VoiceId::from("developer")];
        let mut ids = Vec::new();
        for _ in 0..25 {
            ids.push(memory.record_collaboration_outcome(
                &voice,
                TaskType::CodeGeneration,
                Outcome::Success,
                metrics(0.8),
            ));
        }

        let history = memory.history(&voice[0]);
        assert_eq!(history.len(), 20);
        // Oldest five records were evicted and, being orphaned, dropped.
        assert!(!history.contains(&ids[0]));
        assert!(memory.record(ids[0]).is_none());
        assert!(memory.record(ids[24]).is_some());
    }

    #[test]
    fn test_eviction_keeps_shared_records() {
        let memory = memory();
        let pair = [VoiceId::from("developer"), VoiceId::from("maintainer")];
        let shared_id = memory.record_collaboration_outcome(
            &pair,
            TaskType::Review,
            Outcome::Success,
            metrics(0.9),
        );
        // Flood only the developer's history.
        for _ in 0..20 {
            memory.record_collaboration_outcome(
                &[pair[0].clone()],
                TaskType::Review,
                Outcome::Partial,
                metrics(0.5),
            );
        }

        assert!(!memory.history(&pair[0]).contains(&shared_id));
        // The maintainer still references it, so the record survives.
        assert!(memory.history(&pair[1]).contains(&shared_id));
        assert!(memory.record(shared_id).is_some());
    }

    #[test]
    fn test_ema_fold_on_outcome() {
        let memory = memory();
        let voice = [VoiceId::from("optimizer")];
        memory.record_collaboration_outcome(
            &voice,
            TaskType::Optimization,
            Outcome::Success,
            metrics(0.9),
        );
        memory.record_collaboration_outcome(
            &voice,
            TaskType::Optimization,
            Outcome::Failure,
            metrics(0.2),
        );

        let perf = memory.performance(&voice[0]).unwrap();
        assert_eq!(perf.samples, 2);
        // Seeded at 1.0 by the success, then folded toward 0.
        assert!((perf.success_rate - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_context_quality_grows_with_content() {
        let memory = memory();
        let empty_quality = memory
            .voice_context(&VoiceQuery::for_voice("guardian"))
            .quality();

        memory.record_collaboration_outcome(
            &[VoiceId::from("guardian")],
            TaskType::Review,
            Outcome::Success,
            metrics(0.95),
        );
        let enriched = memory.voice_context(
            &VoiceQuery::for_voice("guardian").with_prompt("review this"),
        );
        assert!(enriched.quality() > empty_quality);
        assert!(enriched.quality() <= 1.0);
    }

    #[test]
    fn test_synthesis_for_unknown_voice_filters_by_task() {
        let memory = memory();
        let voice = VoiceId::from("custom-reviewer");
        memory.record_collaboration_outcome(
            &[voice.clone()],
            TaskType::Review,
            Outcome::Success,
            metrics(0.9),
        );
        memory.record_collaboration_outcome(
            &[voice.clone()],
            TaskType::Documentation,
            Outcome::Success,
            metrics(0.8),
        );

        // Drop the L1 entry to force synthesis from L2/L3.
        {
            let mut inner = memory.inner.write().unwrap();
            inner.l1.remove(&voice);
        }

        let context = memory.voice_context(
            &VoiceQuery::for_voice("custom-reviewer").with_task_type(TaskType::Review),
        );
        assert!(context
            .success_patterns
            .iter()
            .all(|p| p.starts_with("review")));
    }

    #[test]
    fn test_l2_key_shapes() {
        let family_key = MemoryInner::l2_key(
            &[VoiceId::from("developer"), VoiceId::from("implementor")],
            TaskType::CodeGeneration,
        );
        assert_eq!(family_key, "family_implementation");

        let mixed_key = MemoryInner::l2_key(
            &[VoiceId::from("security"), VoiceId::from("developer")],
            TaskType::Review,
        );
        assert_eq!(mixed_key, "review_developer+security");
    }

    #[test]
    fn test_snapshot_round_trip_preserves_stats() {
        let memory = memory();
        memory.voice_context(&VoiceQuery::for_voice("developer").with_prompt("hello"));
        memory.record_collaboration_outcome(
            &[VoiceId::from("developer"), VoiceId::from("security")],
            TaskType::Review,
            Outcome::Success,
            metrics(0.85),
        );

        let stats = memory.memory_stats();
        let restored = VoiceMemory::restore(memory.snapshot());
        assert_eq!(restored.memory_stats(), stats);
    }
}
