//! Orchestration events and the audit trail.
//!
//! The event system provides an ordered record of what happened to a
//! request. Within one request the trail is totally ordered by emission
//! time and reflects real causality (generate precedes audit precedes
//! refine precedes approve); across requests there is no ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Types of events emitted during request processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Request accepted and validated
    RequestStart,
    /// Red-team verdict on the input
    InputScreen,
    /// Voice selection decided
    VoiceSelect,
    /// Routing decision made for a voice
    Route,
    /// Backend generation for a voice
    Generate,
    /// Audit pass over a draft
    Audit,
    /// Council/dual-agent synthesis
    Synthesize,
    /// Red-team verdict on the output
    OutputScreen,
    /// Voice memory updated
    Memory,
    /// Request reached a terminal state
    Complete,
    /// Error surfaced to the caller
    Error,
    /// Cooperative cancellation observed
    Cancelled,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RequestStart => "request_start",
            Self::InputScreen => "input_screen",
            Self::VoiceSelect => "voice_select",
            Self::Route => "route",
            Self::Generate => "generate",
            Self::Audit => "audit",
            Self::Synthesize => "synthesize",
            Self::OutputScreen => "output_screen",
            Self::Memory => "memory",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// An event emitted while processing a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    /// Type of the event
    pub event_type: EventType,
    /// Request this event belongs to
    pub request_id: String,
    /// Human-readable description
    pub content: String,
    /// Event-specific metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

impl OrchestratorEvent {
    /// Create a new event.
    pub fn new(
        event_type: EventType,
        request_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            request_id: request_id.into(),
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Get a metadata value.
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref()?.get(key)
    }
}

/// Phase of the dual-agent loop a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    Generate,
    Audit,
    Refine,
    Approve,
}

impl std::fmt::Display for AuditPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Generate => "generate",
            Self::Audit => "audit",
            Self::Refine => "refine",
            Self::Approve => "approve",
        };
        write!(f, "{}", s)
    }
}

/// Whether a step marks the start or the completion of its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMarker {
    Start,
    Complete,
}

/// One entry in a request's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditStep {
    /// Which phase this step belongs to
    pub phase: AuditPhase,
    /// Start or completion of that phase
    pub marker: StepMarker,
    /// Short description (model used, score, issue counts, ...)
    pub detail: String,
    /// When the step was emitted
    pub timestamp: DateTime<Utc>,
}

impl AuditStep {
    pub fn start(phase: AuditPhase, detail: impl Into<String>) -> Self {
        Self {
            phase,
            marker: StepMarker::Start,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn complete(phase: AuditPhase, detail: impl Into<String>) -> Self {
        Self {
            phase,
            marker: StepMarker::Complete,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Ordered audit trail for a single request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditTrail {
    steps: Vec<AuditStep>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step; steps are kept in emission order.
    pub fn push(&mut self, step: AuditStep) {
        self.steps.push(step);
    }

    /// Append every step of another trail, preserving order.
    pub fn extend_from(&mut self, other: &AuditTrail) {
        self.steps.extend(other.steps.iter().cloned());
    }

    pub fn steps(&self) -> &[AuditStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the trail contains at least one step of `phase`.
    pub fn has_phase(&self, phase: AuditPhase) -> bool {
        self.steps.iter().any(|s| s.phase == phase)
    }

    /// The phase of the last emitted step, if any.
    pub fn last_phase(&self) -> Option<AuditPhase> {
        self.steps.last().map(|s| s.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_metadata() {
        let event = OrchestratorEvent::new(EventType::Route, "req-1", "speed tier selected")
            .with_metadata("confidence", 0.95)
            .with_metadata("tier", "speed");

        assert_eq!(event.get_metadata("tier").unwrap(), "speed");
        assert!(event.get_metadata("missing").is_none());
    }

    #[test]
    fn test_trail_ordering() {
        let mut trail = AuditTrail::new();
        trail.push(AuditStep::start(AuditPhase::Generate, "draft"));
        trail.push(AuditStep::start(AuditPhase::Audit, "scoring"));
        trail.push(AuditStep::complete(AuditPhase::Approve, "score 92"));

        assert_eq!(trail.len(), 3);
        assert!(trail.has_phase(AuditPhase::Generate));
        assert!(!trail.has_phase(AuditPhase::Refine));
        assert_eq!(trail.last_phase(), Some(AuditPhase::Approve));

        // Emission order is preserved and timestamps are monotone enough
        // to reflect it.
        let steps = trail.steps();
        assert!(steps[0].timestamp <= steps[1].timestamp);
        assert!(steps[1].timestamp <= steps[2].timestamp);
    }

    #[test]
    fn test_trail_serde_round_trip() {
        let mut trail = AuditTrail::new();
        trail.push(AuditStep::start(AuditPhase::Generate, "draft"));

        let json = serde_json::to_string(&trail).unwrap();
        let back: AuditTrail = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trail);
    }
}
