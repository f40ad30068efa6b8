//! # ensemble-core
//!
//! A multi-voice LLM orchestration runtime. A request is screened by a
//! red team, routed to speed- or quality-tier inference backends by a
//! complexity-aware hybrid router, optionally fanned out across several
//! specialist voice personas fed from hierarchical memory, and folded
//! back into one reply by a generator/auditor pair with an ordered audit
//! trail.
//!
//! ## Core components
//!
//! - **Backend**: uniform adapter contract over inference providers
//! - **Router**: complexity scoring, dynamic thresholds, decision cache
//! - **Voice**: personas, selection ROI, L1/L2/L3 memory
//! - **Red team**: parallel inspectors with a consensus verdict
//! - **Council**: dual-agent generate → audit → refine → approve loop
//! - **Orchestrator**: the end-to-end pipeline and process-wide runtime
//!
//! ## Example
//!
//! ```rust,ignore
//! use ensemble_core::{
//!     CancellationToken, OrchestrationConfig, Orchestrator, Request, TaskType,
//! };
//!
//! let orchestrator = Orchestrator::builder(OrchestrationConfig::default()).build()?;
//! let request = Request::new("review this diff", TaskType::Review);
//! let outcome = orchestrator.handle(request, CancellationToken::new()).await?;
//! println!("{}", outcome.response.content);
//! ```

pub mod backend;
pub mod cancel;
pub mod complexity;
pub mod config;
pub mod council;
pub mod error;
pub mod events;
pub mod lru;
pub mod metrics;
pub mod orchestrator;
pub mod redteam;
pub mod request;
pub mod retry;
pub mod router;
pub mod session;
pub mod voice;

// Re-exports for convenience
pub use backend::{
    BackendAdapter, BackendRegistry, BackendResponse, BackendTier, ChatMessage, ChatRole,
    ChunkStream, GenerateOptions, HealthCache, ModelInfo, ModelSelector, OllamaAdapter,
    OpenAiAdapter, StreamChunk, TokenUsage, ToolCall, ToolSpec,
};
pub use cancel::CancellationToken;
pub use complexity::{
    AnalysisContext, ComplexityAnalyzer, ComplexityAssessment, ComplexityMetrics, TaskKind,
};
pub use config::{
    ExecutionMode, OrchestrationConfig, PerformanceThresholds, ProviderConfig, ProviderType,
    SecurityConfig, StreamingConfig, ValidationReport,
};
pub use council::{
    council_prompt, AuditIssue, AuditReport, CoordinatedResponse, CouncilChunk, CouncilConfig,
    DualAgentCoordinator, IssueSeverity,
};
pub use error::{Error, ErrorContext, ErrorKind, ErrorSeverity, Result};
pub use events::{AuditPhase, AuditStep, AuditTrail, EventType, OrchestratorEvent, StepMarker};
pub use metrics::{PerformanceSample, PerformanceStore, SampleOutcome, TierStats};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, OrchestratorOutcome, ToolExecutor, VoiceInvocation,
    REFUSAL_MESSAGE,
};
pub use redteam::{
    CollaborativeAnalysis, Finding, GatePolicy, Inspector, InspectorReport, OutputPolicy,
    RedTeamValidator, ThreatLevel,
};
pub use request::{
    Priority, Request, RequestConstraints, RequestContext, RequestStatus, TaskType,
};
pub use retry::{execute_with_retry, run_fallbacks, FallbackStrategy, RetryPolicy};
pub use router::{
    DecisionCache, Fingerprint, HybridRouter, RouteTier, RouterConfig, RoutingDecision,
};
pub use session::{SessionItem, SessionSnapshot, SessionStore};
pub use voice::{
    CollaborationMetrics, CollaborationRecord, MemoryStats, Outcome, VoiceContext, VoiceFamily,
    VoiceId, VoiceMemory, VoicePreference, VoiceProfile, VoiceRegistry, VoiceSelection,
    VoiceSelector,
};
