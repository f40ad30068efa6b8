//! Voice identities, profiles, and performance records.
//!
//! A voice is a named behavioral configuration (prompt, temperature,
//! specialization) layered on top of a backend. System prompts are
//! materialized lazily on first use and cached.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::lru::LruTtlCache;

/// Smoothing factor for voice performance averages.
pub const PERFORMANCE_EMA_ALPHA: f64 = 0.1;

/// Identifier of a voice persona.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoiceId(pub String);

impl VoiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VoiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VoiceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Family a voice belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceFamily {
    Implementation,
    Analysis,
    Design,
    Quality,
    Security,
}

impl VoiceFamily {
    /// Built-in member voice ids for this family.
    pub fn members(&self) -> &'static [&'static str] {
        match self {
            Self::Implementation => &["developer", "implementor"],
            Self::Analysis => &["analyzer", "optimizer"],
            Self::Design => &["architect", "designer"],
            Self::Quality => &["maintainer", "guardian"],
            Self::Security => &["security"],
        }
    }

    /// Family of a built-in voice id, if known.
    pub fn of(voice: &VoiceId) -> Option<Self> {
        let all = [
            Self::Implementation,
            Self::Analysis,
            Self::Design,
            Self::Quality,
            Self::Security,
        ];
        all.into_iter()
            .find(|f| f.members().contains(&voice.as_str()))
    }
}

impl std::fmt::Display for VoiceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Implementation => "implementation",
            Self::Analysis => "analysis",
            Self::Design => "design",
            Self::Quality => "quality",
            Self::Security => "security",
        };
        write!(f, "{}", s)
    }
}

/// Static identity and behavior of a persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub id: VoiceId,
    pub name: String,
    /// Writing/working style (e.g. "pragmatic", "skeptical")
    pub style: String,
    /// Base sampling temperature
    pub base_temperature: f64,
    /// Domains this voice specializes in
    pub specialization: Vec<String>,
    /// Tool names this voice may use
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

impl VoiceProfile {
    fn builtin(
        id: &str,
        name: &str,
        style: &str,
        base_temperature: f64,
        specialization: &[&str],
    ) -> Self {
        Self {
            id: VoiceId::new(id),
            name: name.to_string(),
            style: style.to_string(),
            base_temperature,
            specialization: specialization.iter().map(|s| s.to_string()).collect(),
            tools: Vec::new(),
        }
    }
}

/// Exponentially-smoothed performance record for a voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoicePerformance {
    pub avg_quality: f64,
    pub avg_latency_ms: f64,
    pub avg_tokens: f64,
    pub success_rate: f64,
    pub cost_per_invocation: f64,
    /// Samples folded in so far
    pub samples: u64,
}

impl Default for VoicePerformance {
    fn default() -> Self {
        Self {
            avg_quality: 0.5,
            avg_latency_ms: 0.0,
            avg_tokens: 0.0,
            success_rate: 1.0,
            cost_per_invocation: 0.0,
            samples: 0,
        }
    }
}

impl VoicePerformance {
    /// Fold a new observation in with EMA smoothing.
    ///
    /// The first sample seeds the averages directly so a single good or
    /// bad run is not diluted by the defaults.
    pub fn fold(&mut self, quality: f64, latency_ms: u64, tokens: u64, success: bool, cost: f64) {
        let q = quality.clamp(0.0, 1.0);
        let s = if success { 1.0 } else { 0.0 };
        if self.samples == 0 {
            self.avg_quality = q;
            self.avg_latency_ms = latency_ms as f64;
            self.avg_tokens = tokens as f64;
            self.success_rate = s;
            self.cost_per_invocation = cost;
        } else {
            let a = PERFORMANCE_EMA_ALPHA;
            self.avg_quality = self.avg_quality * (1.0 - a) + q * a;
            self.avg_latency_ms = self.avg_latency_ms * (1.0 - a) + latency_ms as f64 * a;
            self.avg_tokens = self.avg_tokens * (1.0 - a) + tokens as f64 * a;
            self.success_rate = self.success_rate * (1.0 - a) + s * a;
            self.cost_per_invocation = self.cost_per_invocation * (1.0 - a) + cost * a;
        }
        self.samples += 1;
    }
}

/// A voice with its runtime attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voice {
    pub profile: VoiceProfile,
    /// Set only once a system prompt has been materialized
    pub initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub performance: VoicePerformance,
}

impl Voice {
    pub fn new(profile: VoiceProfile) -> Self {
        Self {
            profile,
            initialized: false,
            system_prompt: None,
            last_used: None,
            usage_count: 0,
            performance: VoicePerformance::default(),
        }
    }

    /// Materialize the system prompt if needed and mark the voice used.
    ///
    /// A voice is never `initialized` without a materialized prompt.
    pub fn ensure_initialized(&mut self, prompts: &mut PromptLibrary) -> &str {
        if self.system_prompt.is_none() {
            let prompt = prompts.materialize(&self.profile);
            self.system_prompt = Some(prompt);
            self.initialized = true;
        }
        self.last_used = Some(Utc::now());
        self.usage_count += 1;
        self.system_prompt.as_deref().expect("prompt just materialized")
    }
}

/// Lazily materialized system prompts with a bounded cache.
pub struct PromptLibrary {
    cache: LruTtlCache<VoiceId, String>,
}

impl PromptLibrary {
    /// Cache bound matches the voice registry scale: 100 entries, 30 min TTL.
    pub fn new() -> Self {
        Self {
            cache: LruTtlCache::new(100, Duration::minutes(30)),
        }
    }

    /// Build (or fetch) the system prompt for a profile.
    pub fn materialize(&mut self, profile: &VoiceProfile) -> String {
        if let Some(prompt) = self.cache.get(&profile.id) {
            return prompt.clone();
        }

        let mut prompt = format!(
            "You are {}, a {} specialist voice in a multi-voice council.\n",
            profile.name, profile.style
        );
        if !profile.specialization.is_empty() {
            prompt.push_str(&format!(
                "Your focus areas: {}.\n",
                profile.specialization.join(", ")
            ));
        }
        if !profile.tools.is_empty() {
            prompt.push_str(&format!(
                "You may call these tools when needed: {}.\n",
                profile.tools.join(", ")
            ));
        }
        prompt.push_str(
            "Answer from your specialty. Be concrete, flag risks you see, \
             and defer out-of-scope concerns to the other voices.",
        );

        self.cache.insert(profile.id.clone(), prompt.clone());
        prompt
    }

    pub fn stats(&self) -> crate::lru::CacheStats {
        self.cache.stats()
    }
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of known voices keyed by id.
#[derive(Debug, Clone)]
pub struct VoiceRegistry {
    voices: HashMap<VoiceId, VoiceProfile>,
}

impl VoiceRegistry {
    /// The nine built-in voices across the five families.
    pub fn builtin() -> Self {
        let profiles = vec![
            VoiceProfile::builtin(
                "developer",
                "Developer",
                "pragmatic",
                0.6,
                &["implementation", "apis", "tooling"],
            ),
            VoiceProfile::builtin(
                "implementor",
                "Implementor",
                "methodical",
                0.4,
                &["implementation", "refactoring"],
            ),
            VoiceProfile::builtin(
                "analyzer",
                "Analyzer",
                "skeptical",
                0.3,
                &["analysis", "debugging", "tracing"],
            ),
            VoiceProfile::builtin(
                "optimizer",
                "Optimizer",
                "measured",
                0.3,
                &["performance", "profiling", "efficiency"],
            ),
            VoiceProfile::builtin(
                "architect",
                "Architect",
                "systemic",
                0.5,
                &["architecture", "boundaries", "scaling"],
            ),
            VoiceProfile::builtin(
                "designer",
                "Designer",
                "exploratory",
                0.7,
                &["design", "interfaces", "ergonomics"],
            ),
            VoiceProfile::builtin(
                "maintainer",
                "Maintainer",
                "conservative",
                0.3,
                &["quality", "readability", "compatibility"],
            ),
            VoiceProfile::builtin(
                "guardian",
                "Guardian",
                "strict",
                0.2,
                &["quality", "testing", "invariants"],
            ),
            VoiceProfile::builtin(
                "security",
                "Security",
                "adversarial",
                0.2,
                &["security", "threat-modeling", "hardening"],
            ),
        ];

        Self {
            voices: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn get(&self, id: &VoiceId) -> Option<&VoiceProfile> {
        self.voices.get(id)
    }

    pub fn contains(&self, id: &VoiceId) -> bool {
        self.voices.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &VoiceId> {
        self.voices.keys()
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// Register a custom voice profile.
    pub fn register(&mut self, profile: VoiceProfile) {
        self.voices.insert(profile.id.clone(), profile);
    }
}
