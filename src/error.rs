//! Error types for ensemble-core.
//!
//! Every fallible operation in the runtime returns a kinded error from the
//! taxonomy below. Retry eligibility and exit-code mapping are derived from
//! the kind, never from string matching.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias using ensemble-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an error, independent of the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Api,
    Validation,
    Timeout,
    RateLimit,
    Authentication,
    FileSystem,
    ToolExecution,
    Parsing,
    Security,
    System,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Api => "api",
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Authentication => "authentication",
            Self::FileSystem => "file_system",
            Self::ToolExecution => "tool_execution",
            Self::Parsing => "parsing",
            Self::Security => "security",
            Self::System => "system",
        };
        write!(f, "{}", s)
    }
}

/// How serious an error is for the request that hit it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Structured context attached to a wrapped error.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorContext {
    /// Operation that was in flight (e.g. "backend.generate")
    pub operation: String,
    /// When the error was observed
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata (backend id, voice id, attempt number, ...)
    pub metadata: HashMap<String, String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Errors that can occur during orchestration.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection-level failure talking to a backend
    #[error("network error: {0}")]
    Network(String),

    /// Backend returned a non-retryable API error
    #[error("backend API error: {backend} - {message}")]
    Api {
        backend: String,
        message: String,
        status: Option<u16>,
    },

    /// Input or state-machine violation
    #[error("validation error: {0}")]
    Validation(String),

    /// Timeout during operation
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Backend signalled rate limiting (429 or explicit)
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// 401/403 from a backend; terminal
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Session snapshot or other file I/O failure
    #[error("filesystem error: {message}")]
    FileSystem {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// An external tool call failed
    #[error("tool execution failed: {tool} - {message}")]
    ToolExecution { tool: String, message: String },

    /// Malformed backend payload or snapshot
    #[error("parse error: {0}")]
    Parsing(String),

    /// Red-team refusal; the response content is replaced
    #[error("security refusal: {0}")]
    Security(String),

    /// Rejected configuration, with the full list of problems
    #[error("configuration rejected: {}", errors.join("; "))]
    Config { errors: Vec<String> },

    /// No healthy backend could serve the request
    #[error("no backend available: {0}")]
    NoBackendAvailable(String),

    /// Cooperative cancellation observed
    #[error("request cancelled")]
    Cancelled,

    /// Internal invariant breakage
    #[error("internal error: {0}")]
    Internal(String),

    /// An error wrapped with operation context
    #[error("{} failed: {source}", context.operation)]
    Wrapped {
        context: ErrorContext,
        #[source]
        source: Box<Error>,
    },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Parsing(e.to_string())
    }
}

impl Error {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Create a backend API error.
    pub fn api(backend: impl Into<String>, message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Api {
            backend: backend.into(),
            message: message.into(),
            status,
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a rate-limit error.
    pub fn rate_limit(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self::RateLimit {
            message: message.into(),
            retry_after_ms,
        }
    }

    /// Create a tool execution error.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a security refusal.
    pub fn security(message: impl Into<String>) -> Self {
        Self::Security(message.into())
    }

    /// Create a configuration error from a list of problems.
    pub fn config(errors: Vec<String>) -> Self {
        Self::Config { errors }
    }

    /// Wrap this error with operation context.
    pub fn in_operation(self, context: ErrorContext) -> Self {
        Self::Wrapped {
            context,
            source: Box::new(self),
        }
    }

    /// The taxonomy kind for this error, seen through any wrapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::NoBackendAvailable(_) => ErrorKind::Network,
            Self::Api { .. } => ErrorKind::Api,
            Self::Validation(_) | Self::Config { .. } => ErrorKind::Validation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::FileSystem { .. } => ErrorKind::FileSystem,
            Self::ToolExecution { .. } => ErrorKind::ToolExecution,
            Self::Parsing(_) => ErrorKind::Parsing,
            Self::Security(_) => ErrorKind::Security,
            Self::Cancelled | Self::Internal(_) => ErrorKind::System,
            Self::Wrapped { source, .. } => source.kind(),
        }
    }

    /// Whether the retry executor may re-attempt the failed operation.
    ///
    /// Only Network, Timeout and RateLimit are eligible; everything else
    /// is terminal for the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit
        )
    }

    /// Severity classification, used to decide best-effort vs refusal paths.
    pub fn severity(&self) -> ErrorSeverity {
        match self.kind() {
            ErrorKind::Security => ErrorSeverity::Critical,
            ErrorKind::Authentication | ErrorKind::System => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }

    /// Process exit code for a CLI surface reporting this error.
    ///
    /// 0 (success) is owned by the caller; errors map to 1-5.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 2,
            Self::Security(_) => 3,
            Self::Cancelled => 4,
            Self::NoBackendAvailable(_) => 5,
            Self::Wrapped { source, .. } => source.exit_code(),
            _ => 1,
        }
    }
}
