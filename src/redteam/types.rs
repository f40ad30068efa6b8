//! Types for multi-agent red-team analysis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounded evidence excerpts carried per finding.
pub const EVIDENCE_CAP: usize = 5;

/// Threat severity scale.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    /// Numeric score used for agreement statistics.
    pub fn score(&self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Medium => 2.0,
            Self::High => 3.0,
            Self::Critical => 4.0,
        }
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// A single security finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Finding category (e.g. "instruction-override", "api-key")
    pub finding_type: String,
    pub severity: ThreatLevel,
    pub description: String,
    /// Matched excerpts, capped at [`EVIDENCE_CAP`]
    pub evidence: Vec<String>,
    pub mitigation: String,
}

impl Finding {
    pub fn new(
        finding_type: impl Into<String>,
        severity: ThreatLevel,
        description: impl Into<String>,
        mitigation: impl Into<String>,
    ) -> Self {
        Self {
            finding_type: finding_type.into(),
            severity,
            description: description.into(),
            evidence: Vec::new(),
            mitigation: mitigation.into(),
        }
    }

    /// Attach an evidence excerpt, respecting the cap.
    pub fn with_evidence(mut self, excerpt: impl Into<String>) -> Self {
        if self.evidence.len() < EVIDENCE_CAP {
            self.evidence.push(excerpt.into());
        }
        self
    }

    /// Dedup key: two findings with the same type, severity and
    /// description are one finding.
    pub fn dedup_key(&self) -> (String, ThreatLevel, String) {
        (
            self.finding_type.clone(),
            self.severity,
            self.description.clone(),
        )
    }
}

/// Result from one inspector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectorReport {
    /// Inspector name
    pub inspector: String,
    /// Threat level this inspector assigns
    pub threat_level: ThreatLevel,
    /// Inspector confidence [0,1]
    pub confidence: f64,
    pub findings: Vec<Finding>,
    pub recommendations: Vec<String>,
    /// Wall-clock time spent inspecting
    pub execution_time_ms: u64,
}

impl InspectorReport {
    /// Fold findings into a report: threat level is the worst severity.
    pub fn from_findings(
        inspector: impl Into<String>,
        findings: Vec<Finding>,
        recommendations: Vec<String>,
        execution_time_ms: u64,
    ) -> Self {
        let threat_level = findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(ThreatLevel::Low);
        let confidence = if findings.is_empty() {
            0.9
        } else {
            (0.6 + 0.1 * findings.len() as f64).min(0.95)
        };

        Self {
            inspector: inspector.into(),
            threat_level,
            confidence,
            findings,
            recommendations,
            execution_time_ms,
        }
    }
}

/// Consensus verdict assembled from all inspector reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborativeAnalysis {
    /// Analysis id
    pub id: String,
    pub consensus_threat_level: ThreatLevel,
    /// How closely the inspectors agreed, in [0,1]
    pub agent_agreement: f64,
    /// Deduplicated findings, most severe first
    pub findings: Vec<Finding>,
    /// Detected inspector disagreements
    pub conflicts: Vec<String>,
    /// Merged, deduplicated recommendations
    pub recommendations: Vec<String>,
    /// Per-inspector reports, for the audit trail
    pub reports: Vec<InspectorReport>,
    pub analyzed_at: DateTime<Utc>,
}

impl CollaborativeAnalysis {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Whether policy should block at the given threshold.
    pub fn at_least(&self, level: ThreatLevel) -> bool {
        self.consensus_threat_level >= level
    }
}
