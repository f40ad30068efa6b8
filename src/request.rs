//! Request model and lifecycle.
//!
//! A [`Request`] is immutable once created: state transitions return a new
//! value and are guarded, so an illegal transition (completing a cancelled
//! request, starting one twice) is a validation error rather than silent
//! mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::voice::VoiceId;

/// Maximum accepted request content length, in characters.
pub const MAX_CONTENT_CHARS: usize = 100_000;

/// What the caller is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    CodeGeneration,
    CodeAnalysis,
    ArchitectureDesign,
    Documentation,
    Optimization,
    Review,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CodeGeneration => "code-generation",
            Self::CodeAnalysis => "code-analysis",
            Self::ArchitectureDesign => "architecture-design",
            Self::Documentation => "documentation",
            Self::Optimization => "optimization",
            Self::Review => "review",
        };
        write!(f, "{}", s)
    }
}

/// Request priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    /// Whether the request has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Optional caller-supplied context about the surrounding project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    /// Languages in play (e.g. "rust", "typescript")
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    /// Frameworks in play
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frameworks: Vec<String>,
    /// Rough project size descriptor ("small", "medium", "large")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_size: Option<String>,
    /// Existing code the request refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_code: Option<String>,
    /// Stated requirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<String>,
    /// Stated constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
}

/// Per-request execution constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestConstraints {
    /// Overall budget for the request in milliseconds (default 180 000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_time_ms: Option<u64>,
    /// Cost ceiling in USD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
    /// Minimum acceptable quality score [0,1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_quality: Option<f64>,
    /// Voices that must not participate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_voices: Vec<VoiceId>,
    /// Voices that must participate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must_include_voices: Vec<VoiceId>,
    /// Requested output format (e.g. "markdown", "json")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

/// An orchestration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique, non-empty request id
    pub id: String,
    /// Prompt content (1..=100 000 chars)
    pub content: String,
    /// Task classification
    pub task_type: TaskType,
    /// Priority
    #[serde(default)]
    pub priority: Priority,
    /// Optional project context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<RequestContext>,
    /// Execution constraints
    #[serde(default)]
    pub constraints: RequestConstraints,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Lifecycle state
    #[serde(default)]
    pub status: RequestStatus,
}

impl Request {
    /// Create a pending request with a fresh id.
    pub fn new(content: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            task_type,
            priority: Priority::default(),
            context: None,
            constraints: RequestConstraints::default(),
            created_at: Utc::now(),
            status: RequestStatus::Pending,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_constraints(mut self, constraints: RequestConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Validate structural invariants: non-empty id, content within bounds.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("request id must be non-empty"));
        }
        if self.content.is_empty() {
            return Err(Error::validation("request content must be non-empty"));
        }
        let chars = self.content.chars().count();
        if chars > MAX_CONTENT_CHARS {
            return Err(Error::validation(format!(
                "request content is {} chars, maximum is {}",
                chars, MAX_CONTENT_CHARS
            )));
        }
        Ok(())
    }

    /// Pending → Processing.
    pub fn start(self) -> Result<Self> {
        self.transition(RequestStatus::Pending, RequestStatus::Processing)
    }

    /// Processing → Completed.
    pub fn complete(self) -> Result<Self> {
        self.transition(RequestStatus::Processing, RequestStatus::Completed)
    }

    /// Processing → Failed.
    pub fn fail(self) -> Result<Self> {
        self.transition(RequestStatus::Processing, RequestStatus::Failed)
    }

    /// Pending | Processing → Cancelled.
    pub fn cancel(self) -> Result<Self> {
        match self.status {
            RequestStatus::Pending | RequestStatus::Processing => Ok(Self {
                status: RequestStatus::Cancelled,
                ..self
            }),
            from => Err(Error::validation(format!(
                "cannot cancel request {} from state {}",
                self.id, from
            ))),
        }
    }

    fn transition(self, expected: RequestStatus, to: RequestStatus) -> Result<Self> {
        if self.status != expected {
            return Err(Error::validation(format!(
                "illegal transition for request {}: {} -> {}",
                self.id, self.status, to
            )));
        }
        Ok(Self { status: to, ..self })
    }

    /// Effective response-time budget in milliseconds (default 180 000).
    pub fn budget_ms(&self) -> u64 {
        self.constraints.max_response_time_ms.unwrap_or(180_000)
    }
}
