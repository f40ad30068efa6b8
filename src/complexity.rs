//! Task complexity analysis for routing decisions.
//!
//! The analyzer combines a task-kind base score, regex pattern families
//! over the prompt, length and technical-term boosts, caller-supplied
//! code metrics, and contextual adjustments (time of day, historical
//! tier success, live load) into a single score in [0.05, 1.0].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::request::TaskType;

/// Lower clamp for the complexity score.
pub const MIN_COMPLEXITY: f64 = 0.05;
/// Upper clamp for the complexity score.
pub const MAX_COMPLEXITY: f64 = 1.0;

/// Routing-level task classification.
///
/// Broader than [`TaskType`]: routing also distinguishes the cheap
/// mechanical kinds (template, format, edit) that never come in as
/// full requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Template,
    Format,
    Edit,
    Generation,
    Analysis,
    Security,
    Architecture,
    Documentation,
    Optimization,
    Review,
}

impl TaskKind {
    /// Base complexity contribution for this kind.
    pub fn base_score(&self) -> f64 {
        match self {
            Self::Template => 0.15,
            Self::Format => 0.10,
            Self::Edit => 0.25,
            Self::Generation => 0.45,
            Self::Analysis => 0.75,
            Self::Security => 0.90,
            Self::Architecture => 0.85,
            Self::Documentation => 0.25,
            Self::Optimization => 0.60,
            Self::Review => 0.50,
        }
    }
}

impl From<TaskType> for TaskKind {
    fn from(t: TaskType) -> Self {
        match t {
            TaskType::CodeGeneration => Self::Generation,
            TaskType::CodeAnalysis => Self::Analysis,
            TaskType::ArchitectureDesign => Self::Architecture,
            TaskType::Documentation => Self::Documentation,
            TaskType::Optimization => Self::Optimization,
            TaskType::Review => Self::Review,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Template => "template",
            Self::Format => "format",
            Self::Edit => "edit",
            Self::Generation => "generation",
            Self::Analysis => "analysis",
            Self::Security => "security",
            Self::Architecture => "architecture",
            Self::Documentation => "documentation",
            Self::Optimization => "optimization",
            Self::Review => "review",
        };
        write!(f, "{}", s)
    }
}

/// Caller-supplied code metrics that feed the score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexityMetrics {
    /// Lines of code in scope
    #[serde(default)]
    pub lines_of_code: u64,
    /// Number of files in scope
    #[serde(default)]
    pub file_count: u32,
    /// Task spans multiple files
    #[serde(default)]
    pub multi_file: bool,
    /// Caller asked for deep analysis
    #[serde(default)]
    pub deep_analysis: bool,
    /// Task is template generation
    #[serde(default)]
    pub template_generation: bool,
    /// Task has security implications
    #[serde(default)]
    pub security_implications: bool,
    /// Caller's estimate of processing time in ms
    #[serde(default)]
    pub estimated_processing_ms: Option<u64>,
}

impl ComplexityMetrics {
    /// Normalized form used in routing fingerprints: boolean flags plus
    /// bucketed counts, so near-identical inputs share a cache entry.
    pub fn normalized(&self) -> String {
        let loc_bucket = if self.lines_of_code == 0 {
            0
        } else {
            (self.lines_of_code as f64).log10().ceil() as u64
        };
        let file_bucket = match self.file_count {
            0 => 0,
            1..=3 => 1,
            4..=10 => 2,
            _ => 3,
        };
        format!(
            "loc{}:f{}:m{}:d{}:t{}:s{}",
            loc_bucket,
            file_bucket,
            self.multi_file as u8,
            self.deep_analysis as u8,
            self.template_generation as u8,
            self.security_implications as u8
        )
    }
}

/// Live context the analyzer folds into the score.
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    /// Hour of day (0-23); `None` means "now" (UTC)
    pub hour_of_day: Option<u32>,
    /// Historical speed-tier success rate on this task kind, if known
    pub speed_success_on_kind: Option<f64>,
    /// In-flight requests on the speed tier
    pub speed_load: u32,
    /// In-flight requests on the quality tier
    pub quality_load: u32,
}

impl AnalysisContext {
    fn hour(&self) -> u32 {
        use chrono::Timelike;
        self.hour_of_day.unwrap_or_else(|| chrono::Utc::now().hour())
    }
}

/// The result of complexity analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAssessment {
    /// Final score in [0.05, 1.0]
    pub score: f64,
    /// Human-readable factors that shaped the score
    pub factors: Vec<String>,
}

struct PatternFamily {
    name: &'static str,
    weight: f64,
    pattern: &'static LazyLock<Regex>,
}

static DEEP_ANALYSIS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(deep\s+dive|in.?depth|comprehensive|thorough|root\s+cause|investigate|trace\s+through)")
        .expect("invalid regex")
});

static SECURITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(secur|auth|vulnerab|exploit|encrypt|credential|token|injection|permission|sandbox)")
        .expect("invalid regex")
});

static ARCHITECTURAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(architect|system\s+design|design\s+pattern|microservice|scalab|modulari|component\s+boundar)")
        .expect("invalid regex")
});

static OPTIMIZATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(optimi|performance|speed\s+up|efficien|latency|throughput|bottleneck|profil)")
        .expect("invalid regex")
});

static ALGORITHMIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(algorithm|big.?o|time\s+complexity|recursi|dynamic\s+programming|graph\s+travers|backtrack)")
        .expect("invalid regex")
});

static MULTI_ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(multiple|several|various|across|all\s+(the\s+)?(files|modules|services|components))")
        .expect("invalid regex")
});

static INTEGRATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(integrat|connect\s+to|webhook|pipeline|end.?to.?end|wire\s+up)")
        .expect("invalid regex")
});

static REFACTORING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(refactor|restructure|rewrite|reorganize|clean.?up|extract\s+(a\s+)?(function|module|class))")
        .expect("invalid regex")
});

static DEBUGGING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(debug|bug|error|crash|broken|failing|exception|stack\s+trace|regression)")
        .expect("invalid regex")
});

static SIMPLICITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(simple|quick|just|only|trivial|basic|one.?liner)").expect("invalid regex")
});

static FORMATTING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(format|indent|lint|pretty.?print|whitespace|reflow)").expect("invalid regex")
});

static TEMPLATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(template|boilerplate|scaffold|stub\s+out|skeleton)").expect("invalid regex")
});

static TECHNICAL_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(api|database|algorithm|async|concurren\w*|distributed|cache|protocol|compiler|thread|mutex|queue|schema|index|serializ\w*|transaction)\b")
        .expect("invalid regex")
});

static FAMILIES: &[PatternFamily] = &[
    PatternFamily { name: "deep_analysis", weight: 0.30, pattern: &DEEP_ANALYSIS },
    PatternFamily { name: "security", weight: 0.35, pattern: &SECURITY },
    PatternFamily { name: "architectural", weight: 0.30, pattern: &ARCHITECTURAL },
    PatternFamily { name: "optimization", weight: 0.25, pattern: &OPTIMIZATION },
    PatternFamily { name: "algorithmic", weight: 0.30, pattern: &ALGORITHMIC },
    PatternFamily { name: "multi_entity", weight: 0.15, pattern: &MULTI_ENTITY },
    PatternFamily { name: "integration", weight: 0.20, pattern: &INTEGRATION },
    PatternFamily { name: "refactoring", weight: 0.25, pattern: &REFACTORING },
    PatternFamily { name: "debugging", weight: 0.20, pattern: &DEBUGGING },
    PatternFamily { name: "simplicity", weight: -0.10, pattern: &SIMPLICITY },
    PatternFamily { name: "formatting", weight: -0.05, pattern: &FORMATTING },
    PatternFamily { name: "template", weight: -0.10, pattern: &TEMPLATE },
];

/// Pattern-based complexity analyzer.
#[derive(Debug, Clone, Default)]
pub struct ComplexityAnalyzer;

impl ComplexityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Score a task. Pure given an explicit [`AnalysisContext`].
    pub fn analyze(
        &self,
        kind: TaskKind,
        prompt: &str,
        metrics: &ComplexityMetrics,
        ctx: &AnalysisContext,
    ) -> ComplexityAssessment {
        let mut factors = Vec::new();
        let mut score = kind.base_score();
        factors.push(format!("base[{}]={:.2}", kind, kind.base_score()));

        // Prompt pattern families, dampened by match count.
        for family in FAMILIES {
            let matches = family.pattern.find_iter(prompt).count();
            if matches > 0 {
                let dampening = ((matches as f64) / 10.0).min(1.0);
                let contribution = family.weight * dampening;
                score += contribution;
                factors.push(format!(
                    "{}x{}={:+.3}",
                    family.name, matches, contribution
                ));
            }
        }

        // Length boost for prompts past 500 chars.
        let len = prompt.chars().count();
        if len > 500 {
            let boost = (((len - 500) as f64) / 2000.0).min(0.30);
            score += boost;
            factors.push(format!("length={:+.3}", boost));
        }

        // Technical-term boost.
        let terms = TECHNICAL_TERMS.find_iter(prompt).count();
        if terms > 0 {
            let boost = (terms as f64 * 0.10).min(0.25);
            score += boost;
            factors.push(format!("terms x{}={:+.3}", terms, boost));
        }

        // Caller metrics.
        if metrics.file_count > 10 {
            score += 0.40;
            factors.push("files>10=+0.40".into());
        } else if metrics.file_count > 3 {
            score += 0.20;
            factors.push("files>3=+0.20".into());
        }
        if metrics.lines_of_code > 0 {
            let boost = (((metrics.lines_of_code + 1) as f64).log10() * 0.10).min(0.30);
            score += boost;
            factors.push(format!("loc={:+.3}", boost));
        }
        if metrics.security_implications {
            score += 0.40;
            factors.push("security_implications=+0.40".into());
        }
        if metrics.deep_analysis {
            score += 0.35;
            factors.push("deep_analysis=+0.35".into());
        }
        if metrics.multi_file {
            score += 0.25;
            factors.push("multi_file=+0.25".into());
        }
        if metrics.template_generation {
            score -= 0.10;
            factors.push("template_generation=-0.10".into());
        }

        // Business hours run slightly leaner; off hours can afford depth.
        let hour = ctx.hour();
        let time_factor = if (9..18).contains(&hour) { 0.95 } else { 1.05 };
        score *= time_factor;
        factors.push(format!("hour{}x{:.2}", hour, time_factor));

        // Historical speed-tier success on this kind.
        if let Some(success) = ctx.speed_success_on_kind {
            if success < 0.7 {
                score += 0.15;
                factors.push(format!("speed_success={:.2}=+0.15", success));
            } else if success > 0.9 {
                score -= 0.10;
                factors.push(format!("speed_success={:.2}=-0.10", success));
            }
        }

        // Under load, lean toward the less-loaded tier.
        let total_load = ctx.speed_load + ctx.quality_load;
        if total_load > 5 {
            if ctx.speed_load < ctx.quality_load {
                score -= 0.05;
                factors.push("load_shift=-0.05".into());
            } else if ctx.quality_load < ctx.speed_load {
                score += 0.05;
                factors.push("load_shift=+0.05".into());
            }
        }

        ComplexityAssessment {
            score: score.clamp(MIN_COMPLEXITY, MAX_COMPLEXITY),
            factors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_at(hour: u32) -> AnalysisContext {
        AnalysisContext {
            hour_of_day: Some(hour),
            ..Default::default()
        }
    }

    #[test]
    fn test_template_prompt_scores_low() {
        let analyzer = ComplexityAnalyzer::new();
        let assessment = analyzer.analyze(
            TaskKind::Template,
            "format this JSON",
            &ComplexityMetrics::default(),
            &ctx_at(12),
        );
        assert!(assessment.score < 0.30, "score was {}", assessment.score);
    }

    #[test]
    fn test_security_architecture_scores_high() {
        let analyzer = ComplexityAnalyzer::new();
        let assessment = analyzer.analyze(
            TaskKind::Architecture,
            "Design a secure authentication flow with token rotation",
            &ComplexityMetrics::default(),
            &ctx_at(12),
        );
        assert!(assessment.score >= 0.85, "score was {}", assessment.score);
    }

    #[test]
    fn test_score_clamped_to_bounds() {
        let analyzer = ComplexityAnalyzer::new();

        let metrics = ComplexityMetrics {
            lines_of_code: 1_000_000,
            file_count: 200,
            multi_file: true,
            deep_analysis: true,
            security_implications: true,
            ..Default::default()
        };
        let high = analyzer.analyze(TaskKind::Security, "audit everything", &metrics, &ctx_at(3));
        assert!(high.score <= MAX_COMPLEXITY);

        let low = analyzer.analyze(
            TaskKind::Format,
            "just a simple quick format",
            &ComplexityMetrics {
                template_generation: true,
                ..Default::default()
            },
            &ctx_at(12),
        );
        assert!(low.score >= MIN_COMPLEXITY);
    }

    #[test]
    fn test_file_count_boosts() {
        let analyzer = ComplexityAnalyzer::new();
        let base = analyzer.analyze(
            TaskKind::Edit,
            "rename a symbol",
            &ComplexityMetrics::default(),
            &ctx_at(12),
        );
        let few = analyzer.analyze(
            TaskKind::Edit,
            "rename a symbol",
            &ComplexityMetrics {
                file_count: 5,
                ..Default::default()
            },
            &ctx_at(12),
        );
        let many = analyzer.analyze(
            TaskKind::Edit,
            "rename a symbol",
            &ComplexityMetrics {
                file_count: 15,
                ..Default::default()
            },
            &ctx_at(12),
        );
        assert!(few.score > base.score);
        assert!(many.score > few.score);
    }

    #[test]
    fn test_poor_speed_history_raises_score() {
        let analyzer = ComplexityAnalyzer::new();
        let metrics = ComplexityMetrics::default();

        let neutral = analyzer.analyze(TaskKind::Analysis, "analyze this module", &metrics, &ctx_at(12));

        let mut ctx = ctx_at(12);
        ctx.speed_success_on_kind = Some(0.5);
        let degraded = analyzer.analyze(TaskKind::Analysis, "analyze this module", &metrics, &ctx);

        assert!(degraded.score > neutral.score);
    }

    #[test]
    fn test_off_hours_multiplier() {
        let analyzer = ComplexityAnalyzer::new();
        let metrics = ComplexityMetrics::default();

        let business = analyzer.analyze(TaskKind::Review, "review this change", &metrics, &ctx_at(11));
        let night = analyzer.analyze(TaskKind::Review, "review this change", &metrics, &ctx_at(2));
        assert!(night.score > business.score);
    }

    #[test]
    fn test_load_shift_requires_pressure() {
        let analyzer = ComplexityAnalyzer::new();
        let metrics = ComplexityMetrics::default();

        let mut light = ctx_at(12);
        light.speed_load = 1;
        light.quality_load = 2;
        let unshifted = analyzer.analyze(TaskKind::Review, "review", &metrics, &light);

        let mut heavy = ctx_at(12);
        heavy.speed_load = 2;
        heavy.quality_load = 6;
        let shifted = analyzer.analyze(TaskKind::Review, "review", &metrics, &heavy);

        // Under pressure with the speed tier less loaded, the score dips.
        assert!(shifted.score < unshifted.score);
    }

    #[test]
    fn test_match_dampening() {
        let analyzer = ComplexityAnalyzer::new();
        let metrics = ComplexityMetrics::default();

        let one = analyzer.analyze(TaskKind::Generation, "debug this", &metrics, &ctx_at(12));
        let many = analyzer.analyze(
            TaskKind::Generation,
            "debug the bug causing the error and the crash in the failing broken build",
            &metrics,
            &ctx_at(12),
        );
        assert!(many.score > one.score);
    }

    #[test]
    fn test_normalized_metrics_bucket() {
        let a = ComplexityMetrics {
            lines_of_code: 120,
            file_count: 5,
            ..Default::default()
        };
        let b = ComplexityMetrics {
            lines_of_code: 800,
            file_count: 9,
            ..Default::default()
        };
        // Same buckets despite different raw counts.
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn test_task_kind_mapping() {
        assert_eq!(TaskKind::from(TaskType::ArchitectureDesign), TaskKind::Architecture);
        assert_eq!(TaskKind::from(TaskType::CodeAnalysis), TaskKind::Analysis);
        assert!(TaskKind::Security.base_score() > TaskKind::Template.base_score());
    }
}
