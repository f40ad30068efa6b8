//! Voice selection and single-vs-multi mode optimization.
//!
//! Prompts are classified into task categories by keyword families; each
//! category maps to a preferred voice. An ROI pass then decides whether
//! fanning out to additional voices buys enough expected quality to pay
//! for the extra tokens and synthesis time.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use super::types::{VoiceFamily, VoiceId, VoicePerformance};
use crate::request::RequestConstraints;

/// Quality-gain credit per additional voice, scaled by affinity.
const GAIN_PER_VOICE: f64 = 0.15;
/// Cap on total expected quality gain from fan-out.
const GAIN_CAP: f64 = 0.30;
/// Minimum gain for a multi recommendation.
const GAIN_FLOOR: f64 = 0.15;
/// Token overhead multiplier per participating voice.
const TOKEN_OVERHEAD: f64 = 1.15;
/// Fixed synthesis overhead added to the parallel time estimate.
const SYNTHESIS_OVERHEAD_MS: u64 = 200;
/// Most voices a selection will fan out to.
const MAX_VOICES: usize = 3;

/// Caller preference for fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoicePreference {
    Single,
    Multi,
    #[default]
    Auto,
}

/// Caller preference for latency vs depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeConstraint {
    Fast,
    #[default]
    Thorough,
}

/// A task category detected in the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Implementation,
    Analysis,
    Design,
    Quality,
    Security,
}

impl TaskCategory {
    /// Preferred voice for this category.
    pub fn preferred_voice(&self) -> VoiceId {
        let id = match self {
            Self::Implementation => "developer",
            Self::Analysis => "analyzer",
            Self::Design => "architect",
            Self::Quality => "maintainer",
            Self::Security => "security",
        };
        VoiceId::from(id)
    }

    pub fn family(&self) -> VoiceFamily {
        match self {
            Self::Implementation => VoiceFamily::Implementation,
            Self::Analysis => VoiceFamily::Analysis,
            Self::Design => VoiceFamily::Design,
            Self::Quality => VoiceFamily::Quality,
            Self::Security => VoiceFamily::Security,
        }
    }
}

static IMPLEMENTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(implement|build|create|write|develop|add\s+(a\s+)?(feature|endpoint|function)|generate\s+code)")
        .expect("invalid regex")
});

static ANALYSIS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(analy[sz]e|debug|investigate|why\s+(does|is)|understand|trace|diagnose|root\s+cause)")
        .expect("invalid regex")
});

static DESIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(design|architect|structure|interface|schema|api\s+shape|pattern|boundar)")
        .expect("invalid regex")
});

static QUALITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(test|refactor|clean\s*up|maintain|review|readab|lint|coverage)")
        .expect("invalid regex")
});

static SECURITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(secur|auth|vulnerab|encrypt|exploit|injection|credential|token|harden)")
        .expect("invalid regex")
});

/// Classification result: categories ordered by match strength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// (category, match count), strongest first
    pub categories: Vec<(TaskCategory, usize)>,
}

impl Classification {
    /// Classify a prompt against the keyword families.
    pub fn of(prompt: &str) -> Self {
        let families: [(TaskCategory, &LazyLock<Regex>); 5] = [
            (TaskCategory::Implementation, &IMPLEMENTATION),
            (TaskCategory::Analysis, &ANALYSIS),
            (TaskCategory::Design, &DESIGN),
            (TaskCategory::Quality, &QUALITY),
            (TaskCategory::Security, &SECURITY),
        ];

        let mut categories: Vec<(TaskCategory, usize)> = families
            .into_iter()
            .filter_map(|(category, pattern)| {
                let hits = pattern.find_iter(prompt).count();
                (hits > 0).then_some((category, hits))
            })
            .collect();
        categories.sort_by(|a, b| b.1.cmp(&a.1));

        Self { categories }
    }

    pub fn is_unsure(&self) -> bool {
        self.categories.is_empty()
    }

    /// Affinity of a category: match count normalized to [0, 1].
    pub fn affinity(&self, category: TaskCategory) -> f64 {
        self.categories
            .iter()
            .find(|(c, _)| *c == category)
            .map_or(0.0, |(_, hits)| (*hits as f64 / 3.0).min(1.0))
    }
}

/// ROI numbers behind a mode decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiAnalysis {
    /// Expected quality gain from the additional voices
    pub expected_quality_gain: f64,
    /// Token cost estimate across all voices, overhead included
    pub estimated_token_cost: u64,
    /// Wall-clock estimate: slowest voice plus synthesis overhead
    pub estimated_time_cost_ms: u64,
    /// Gain needed for the fan-out to break even
    pub break_even_gain: f64,
    /// Gain per unit of marginal normalized cost
    pub roi_score: f64,
    /// Whether multi-voice is recommended
    pub recommend_multi: bool,
}

/// A completed voice selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSelection {
    /// Voices to run, in priority order
    pub voices: Vec<VoiceId>,
    /// Whether synthesis will merge multiple outputs
    pub multi: bool,
    /// ROI analysis, when one was performed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roi: Option<RoiAnalysis>,
    /// How the selection was reached
    pub reasoning: String,
}

/// Default latency estimate for a voice with no history.
pub const DEFAULT_VOICE_LATENCY_MS: u64 = 3_000;

/// Per-voice latency estimates used by the ROI pass.
pub trait LatencySource {
    fn estimated_latency_ms(&self, voice: &VoiceId) -> u64;
}

/// Latency source over a snapshot of voice performance records.
#[derive(Debug, Clone, Default)]
pub struct SnapshotLatency {
    pub latencies: std::collections::HashMap<VoiceId, u64>,
}

impl SnapshotLatency {
    pub fn from_performance<'a>(
        records: impl Iterator<Item = (&'a VoiceId, &'a VoicePerformance)>,
    ) -> Self {
        Self {
            latencies: records
                .filter(|(_, p)| p.samples > 0)
                .map(|(id, p)| (id.clone(), p.avg_latency_ms as u64))
                .collect(),
        }
    }
}

impl LatencySource for SnapshotLatency {
    fn estimated_latency_ms(&self, voice: &VoiceId) -> u64 {
        self.latencies
            .get(voice)
            .copied()
            .unwrap_or(DEFAULT_VOICE_LATENCY_MS)
    }
}

/// Voice selector / mode optimizer.
#[derive(Debug, Clone, Default)]
pub struct VoiceSelector;

impl VoiceSelector {
    pub fn new() -> Self {
        Self
    }

    /// Select voices for a prompt under the caller's preferences.
    pub fn select(
        &self,
        prompt: &str,
        preference: VoicePreference,
        time: TimeConstraint,
        constraints: &RequestConstraints,
        latency: &dyn LatencySource,
    ) -> VoiceSelection {
        let classification = Classification::of(prompt);
        let mut reasoning = Vec::new();

        // Candidate voices: one per matched category, strongest first;
        // the fallback pair covers an unsure classification.
        let mut candidates: Vec<VoiceId> = if classification.is_unsure() {
            reasoning.push("classifier unsure; using fallback pair".to_string());
            vec![VoiceId::from("developer"), VoiceId::from("maintainer")]
        } else {
            reasoning.push(format!(
                "categories: {}",
                classification
                    .categories
                    .iter()
                    .map(|(c, n)| format!("{:?} x{}", c, n))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            classification
                .categories
                .iter()
                .map(|(c, _)| c.preferred_voice())
                .collect()
        };

        // Must-include voices lead; excluded voices are dropped outright.
        for voice in constraints.must_include_voices.iter().rev() {
            candidates.retain(|v| v != voice);
            candidates.insert(0, voice.clone());
        }
        candidates.retain(|v| !constraints.excluded_voices.contains(v));
        candidates.dedup();
        candidates.truncate(MAX_VOICES);

        if candidates.is_empty() {
            // Everything was excluded; fall back to whatever remains legal.
            candidates = [VoiceId::from("developer"), VoiceId::from("maintainer")]
                .into_iter()
                .filter(|v| !constraints.excluded_voices.contains(v))
                .take(1)
                .collect();
            reasoning.push("all candidates excluded; minimal fallback".to_string());
        }

        // The security voice participates whenever the security family
        // matched; it is a gate, not an ROI optimization.
        let security_forced = classification.affinity(TaskCategory::Security) > 0.0
            && candidates.contains(&TaskCategory::Security.preferred_voice());

        let (multi, roi) = match (preference, time) {
            (VoicePreference::Single, _) => {
                reasoning.push("caller forced single".to_string());
                (false, None)
            }
            (VoicePreference::Multi, _) => {
                reasoning.push("caller forced multi".to_string());
                (candidates.len() > 1, None)
            }
            (VoicePreference::Auto, TimeConstraint::Fast) if !security_forced => {
                reasoning.push("fast constraint biases single".to_string());
                (false, None)
            }
            (VoicePreference::Auto, _) => {
                let roi = self.analyze_roi(prompt, &classification, &candidates, latency);
                reasoning.push(format!(
                    "roi={:.2} gain={:.2} break_even={:.2}",
                    roi.roi_score, roi.expected_quality_gain, roi.break_even_gain
                ));
                let multi = roi.recommend_multi || security_forced;
                if security_forced && !roi.recommend_multi {
                    reasoning.push("security voice retained despite roi".to_string());
                }
                (multi && candidates.len() > 1, Some(roi))
            }
        };

        if !multi {
            candidates.truncate(1);
        }

        VoiceSelection {
            voices: candidates,
            multi,
            roi,
            reasoning: reasoning.join("; "),
        }
    }

    /// Estimate whether fan-out pays for itself.
    fn analyze_roi(
        &self,
        prompt: &str,
        classification: &Classification,
        candidates: &[VoiceId],
        latency: &dyn LatencySource,
    ) -> RoiAnalysis {
        let prompt_tokens = (prompt.chars().count() / 4).max(1) as u64;
        let count = candidates.len() as u64;

        // Quality gain: affinity-weighted credit per additional voice.
        let mut gain = 0.0;
        for voice in candidates.iter().skip(1) {
            let affinity = classification
                .categories
                .iter()
                .filter(|(c, _)| c.preferred_voice() == *voice || c.family().members().contains(&voice.as_str()))
                .map(|(c, _)| classification.affinity(*c))
                .fold(0.0f64, f64::max);
            gain += GAIN_PER_VOICE * affinity.max(0.3);
        }
        let gain = gain.min(GAIN_CAP);

        let multi_tokens = (prompt_tokens as f64 * count as f64 * TOKEN_OVERHEAD) as u64;
        let single_tokens = (prompt_tokens as f64 * TOKEN_OVERHEAD) as u64;

        let slowest = candidates
            .iter()
            .map(|v| latency.estimated_latency_ms(v))
            .max()
            .unwrap_or(3_000);
        let single_time = candidates
            .first()
            .map_or(3_000, |v| latency.estimated_latency_ms(v));
        let multi_time = slowest + SYNTHESIS_OVERHEAD_MS;

        // Marginal cost of fan-out, normalized against a 10k-token /
        // 10 s budget so the ROI threshold is scale-free.
        let marginal_tokens = multi_tokens.saturating_sub(single_tokens);
        let marginal_time = multi_time.saturating_sub(single_time);
        let normalized_cost =
            marginal_tokens as f64 / 10_000.0 + marginal_time as f64 / 10_000.0;
        let break_even = normalized_cost;
        let roi_score = gain / (normalized_cost + 0.05);

        RoiAnalysis {
            expected_quality_gain: gain,
            estimated_token_cost: multi_tokens,
            estimated_time_cost_ms: multi_time,
            break_even_gain: break_even,
            roi_score,
            recommend_multi: roi_score > 1.0 && gain > GAIN_FLOOR,
        }
    }
}
