//! Voice personas: identities, selection, and hierarchical memory.

mod memory;
mod selector;
mod types;

pub use memory::{
    CollaborationMetrics, CollaborationRecord, MemorySnapshot, MemoryStats, Outcome, RecordId,
    SharedContext, VoiceContext, VoiceMemory, VoiceQuery,
};
pub use selector::{
    Classification, LatencySource, RoiAnalysis, SnapshotLatency, TaskCategory, TimeConstraint,
    VoicePreference, VoiceSelection, VoiceSelector, DEFAULT_VOICE_LATENCY_MS,
};
pub use types::{
    PromptLibrary, Voice, VoiceFamily, VoiceId, VoicePerformance, VoiceProfile, VoiceRegistry,
    PERFORMANCE_EMA_ALPHA,
};
