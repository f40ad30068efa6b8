//! Multi-agent red-team validation.
//!
//! Five specialized inspectors run in parallel over the same input; their
//! reports are folded into a consensus verdict by a pure synthesis
//! function, so the same reports always produce the same verdict. A
//! completion event is broadcast so the orchestrator can block,
//! quarantine, or annotate.

mod inspectors;
mod types;

pub use inspectors::{
    CodeSecurityInspector, DataExfiltrationInspector, Inspector, PrivilegeEscalationInspector,
    PromptInjectionInspector, SecretsInspector,
};
pub use types::{CollaborativeAnalysis, Finding, InspectorReport, ThreatLevel, EVIDENCE_CAP};

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::{info, instrument};

/// What to do when input analysis crosses the block threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// Fail the request with a security error
    #[default]
    Block,
    /// Let the request proceed, carrying the analysis as warnings
    Annotate,
}

/// When output analysis runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// Analyze every outbound response
    #[default]
    Always,
    /// Analyze outbound responses only when the input was flagged
    FlaggedOnly,
}

/// The deterministic part of a verdict, before ids and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    pub threat_level: ThreatLevel,
    pub agreement: f64,
    pub findings: Vec<Finding>,
    pub conflicts: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Consensus-level advice prepended to the merged recommendations.
fn consensus_advice(level: ThreatLevel) -> &'static str {
    match level {
        ThreatLevel::Low => "no action required; proceed normally",
        ThreatLevel::Medium => "proceed with the flagged sections sanitized",
        ThreatLevel::High => "require human review before acting on this content",
        ThreatLevel::Critical => "block this content and preserve the audit trail",
    }
}

/// Fold inspector reports into a consensus. Pure and deterministic.
pub fn synthesize(reports: &[InspectorReport]) -> Consensus {
    // Consensus level: any critical wins; then majority voting.
    let total = reports.len().max(1);
    let critical = reports
        .iter()
        .any(|r| r.threat_level == ThreatLevel::Critical);
    let high_votes = reports
        .iter()
        .filter(|r| r.threat_level >= ThreatLevel::High)
        .count();
    let medium_votes = reports
        .iter()
        .filter(|r| r.threat_level >= ThreatLevel::Medium)
        .count();

    let threat_level = if critical {
        ThreatLevel::Critical
    } else if high_votes * 2 >= total {
        ThreatLevel::High
    } else if medium_votes * 2 >= total {
        ThreatLevel::Medium
    } else {
        ThreatLevel::Low
    };

    // Agreement: 1 - variance(score)/2, clamped to [0,1].
    let scores: Vec<f64> = reports.iter().map(|r| r.threat_level.score()).collect();
    let agreement = if scores.is_empty() {
        1.0
    } else {
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        let variance =
            scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
        (1.0 - variance / 2.0).clamp(0.0, 1.0)
    };

    // Findings: dedup by (type, severity, description), most severe first.
    let mut seen = HashSet::new();
    let mut findings: Vec<Finding> = reports
        .iter()
        .flat_map(|r| r.findings.iter().cloned())
        .filter(|f| seen.insert(f.dedup_key()))
        .collect();
    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.finding_type.cmp(&b.finding_type))
    });

    // Conflicts: polar disagreement or a wide confidence spread.
    let mut conflicts = Vec::new();
    let min_level = reports.iter().map(|r| r.threat_level).min();
    let max_level = reports.iter().map(|r| r.threat_level).max();
    if let (Some(ThreatLevel::Low), Some(ThreatLevel::Critical)) = (min_level, max_level) {
        let low = reports
            .iter()
            .filter(|r| r.threat_level == ThreatLevel::Low)
            .map(|r| r.inspector.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let critical_names = reports
            .iter()
            .filter(|r| r.threat_level == ThreatLevel::Critical)
            .map(|r| r.inspector.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        conflicts.push(format!(
            "polar verdicts: [{}] report low while [{}] report critical",
            low, critical_names
        ));
    }
    if let (Some(min_c), Some(max_c)) = (
        reports
            .iter()
            .map(|r| r.confidence)
            .min_by(|a, b| a.total_cmp(b)),
        reports
            .iter()
            .map(|r| r.confidence)
            .max_by(|a, b| a.total_cmp(b)),
    ) {
        if max_c - min_c > 0.3 {
            conflicts.push(format!(
                "confidence spread {:.2} exceeds 0.30",
                max_c - min_c
            ));
        }
    }

    // Recommendations: consensus advice first, inspector advice after,
    // deduplicated while preserving order.
    let mut recommendations = vec![consensus_advice(threat_level).to_string()];
    let mut seen_recs: HashSet<String> = recommendations.iter().cloned().collect();
    for report in reports {
        for rec in &report.recommendations {
            if seen_recs.insert(rec.clone()) {
                recommendations.push(rec.clone());
            }
        }
    }

    Consensus {
        threat_level,
        agreement,
        findings,
        conflicts,
        recommendations,
    }
}

/// The red-team validator: parallel inspectors plus consensus synthesis.
pub struct RedTeamValidator {
    inspectors: Vec<Box<dyn Inspector>>,
    events: broadcast::Sender<CollaborativeAnalysis>,
}

impl RedTeamValidator {
    /// Validator with the five standard inspectors.
    pub fn new() -> Self {
        Self::with_inspectors(vec![
            Box::new(PromptInjectionInspector),
            Box::new(CodeSecurityInspector),
            Box::new(SecretsInspector),
            Box::new(PrivilegeEscalationInspector),
            Box::new(DataExfiltrationInspector),
        ])
    }

    pub fn with_inspectors(inspectors: Vec<Box<dyn Inspector>>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self { inspectors, events }
    }

    /// Subscribe to completed analyses.
    pub fn subscribe(&self) -> broadcast::Receiver<CollaborativeAnalysis> {
        self.events.subscribe()
    }

    /// Run every inspector in parallel and synthesize the verdict.
    #[instrument(skip_all, fields(input_len = input.len()))]
    pub async fn analyze(&self, input: &str) -> CollaborativeAnalysis {
        let reports: Vec<InspectorReport> =
            join_all(self.inspectors.iter().map(|i| i.inspect(input))).await;

        let consensus = synthesize(&reports);
        info!(
            level = %consensus.threat_level,
            agreement = consensus.agreement,
            findings = consensus.findings.len(),
            "red-team verdict"
        );

        let analysis = CollaborativeAnalysis {
            id: CollaborativeAnalysis::new_id(),
            consensus_threat_level: consensus.threat_level,
            agent_agreement: consensus.agreement,
            findings: consensus.findings,
            conflicts: consensus.conflicts,
            recommendations: consensus.recommendations,
            reports,
            analyzed_at: Utc::now(),
        };

        // Nobody listening is fine; the verdict is still returned.
        let _ = self.events.send(analysis.clone());
        analysis
    }
}

impl Default for RedTeamValidator {
    fn default() -> Self {
        Self::new()
    }
}
