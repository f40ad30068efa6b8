//! Session snapshot persistence.
//!
//! Memory state is written to a session directory as
//! `context-<sessionId>.json` plus a `context-latest.json` alias, at most
//! once every five minutes and unconditionally on graceful shutdown.
//! Completed work is idempotent; a crash between writes only loses
//! in-flight context.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use crate::error::{Error, Result};
use crate::voice::{
    CollaborationRecord, MemorySnapshot, RecordId, SharedContext, VoiceContext, VoiceId,
    VoiceMemory,
};

/// Minimum spacing between throttled writes.
const WRITE_INTERVAL_MINUTES: i64 = 5;

/// One persisted memory item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionItem {
    /// L1 per-voice context
    VoiceContext { context: VoiceContext },
    /// L2 shared context with its cache key
    SharedContext { key: String, context: SharedContext },
    /// L3 collaboration record
    Collaboration { id: RecordId, record: CollaborationRecord },
    /// L3 per-voice reference list
    History { voice: VoiceId, records: Vec<RecordId> },
}

/// The on-disk session snapshot shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub items: Vec<SessionItem>,
    pub summary: String,
}

impl SessionSnapshot {
    /// Build a snapshot from live memory.
    pub fn capture(session_id: &str, memory: &VoiceMemory, summary: &str) -> Self {
        let image = memory.snapshot();
        let mut items = Vec::new();

        for context in image.l1 {
            items.push(SessionItem::VoiceContext { context });
        }
        for (key, context) in image.l2 {
            items.push(SessionItem::SharedContext { key, context });
        }
        for (id, record) in image.records {
            items.push(SessionItem::Collaboration { id, record });
        }
        for (voice, records) in image.by_voice {
            items.push(SessionItem::History { voice, records });
        }

        Self {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            items,
            summary: summary.to_string(),
        }
    }

    /// Rebuild memory from a snapshot.
    pub fn into_memory(self) -> VoiceMemory {
        let mut image = MemorySnapshot {
            l1: Vec::new(),
            l2: Vec::new(),
            records: Vec::new(),
            by_voice: Vec::new(),
            next_record_id: 0,
        };

        for item in self.items {
            match item {
                SessionItem::VoiceContext { context } => image.l1.push(context),
                SessionItem::SharedContext { key, context } => image.l2.push((key, context)),
                SessionItem::Collaboration { id, record } => {
                    image.next_record_id = image.next_record_id.max(id + 1);
                    image.records.push((id, record));
                }
                SessionItem::History { voice, records } => image.by_voice.push((voice, records)),
            }
        }

        VoiceMemory::restore(image)
    }
}

/// Throttled session snapshot writer.
pub struct SessionStore {
    dir: PathBuf,
    session_id: String,
    last_written: Mutex<Option<DateTime<Utc>>>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            session_id: session_id.into(),
            last_written: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn session_path(&self) -> PathBuf {
        self.dir.join(format!("context-{}.json", self.session_id))
    }

    fn latest_path(&self) -> PathBuf {
        self.dir.join("context-latest.json")
    }

    /// Persist if the write interval has elapsed. Returns whether a write
    /// happened.
    pub async fn persist(&self, memory: &VoiceMemory, summary: &str) -> Result<bool> {
        {
            let last = self.last_written.lock().expect("session lock poisoned");
            if let Some(at) = *last {
                if Utc::now() - at < Duration::minutes(WRITE_INTERVAL_MINUTES) {
                    return Ok(false);
                }
            }
        }
        self.flush(memory, summary).await?;
        Ok(true)
    }

    /// Persist unconditionally (graceful shutdown path).
    pub async fn flush(&self, memory: &VoiceMemory, summary: &str) -> Result<()> {
        let snapshot = SessionSnapshot::capture(&self.session_id, memory, summary);
        let payload = serde_json::to_vec_pretty(&snapshot)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::FileSystem {
                message: format!("creating session dir {}", self.dir.display()),
                source: Some(e),
            })?;
        for path in [self.session_path(), self.latest_path()] {
            tokio::fs::write(&path, &payload)
                .await
                .map_err(|e| Error::FileSystem {
                    message: format!("writing snapshot {}", path.display()),
                    source: Some(e),
                })?;
        }

        *self.last_written.lock().expect("session lock poisoned") = Some(Utc::now());
        info!(session = %self.session_id, items = snapshot.items.len(), "session snapshot written");
        Ok(())
    }

    /// Load the latest snapshot from a session directory, if present.
    pub async fn load_latest(dir: impl AsRef<Path>) -> Result<Option<SessionSnapshot>> {
        let path = dir.as_ref().join("context-latest.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot = serde_json::from_slice(&bytes)?;
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::FileSystem {
                message: format!("reading snapshot {}", path.display()),
                source: Some(e),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TaskType;
    use crate::voice::{CollaborationMetrics, Outcome, VoiceQuery, VoiceRegistry};
    use pretty_assertions::assert_eq;

    fn seeded_memory() -> VoiceMemory {
        let memory = VoiceMemory::new(&VoiceRegistry::builtin());
        memory.voice_context(&VoiceQuery::for_voice("developer").with_prompt("hello"));
        memory.record_collaboration_outcome(
            &[VoiceId::from("developer"), VoiceId::from("security")],
            TaskType::Review,
            Outcome::Success,
            CollaborationMetrics {
                quality: 0.9,
                tokens: 300,
                duration_ms: 1_200,
                cost_usd: 0.003,
            },
        );
        memory
    }

    #[tokio::test]
    async fn test_flush_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), "s1");
        let memory = seeded_memory();

        store.flush(&memory, "two voices reviewed a change").await.unwrap();

        assert!(dir.path().join("context-s1.json").exists());
        assert!(dir.path().join("context-latest.json").exists());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_memory_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), "s2");
        let memory = seeded_memory();
        let stats = memory.memory_stats();

        store.flush(&memory, "summary").await.unwrap();
        let snapshot = SessionStore::load_latest(dir.path()).await.unwrap().unwrap();
        assert_eq!(snapshot.session_id, "s2");

        let restored = snapshot.into_memory();
        assert_eq!(restored.memory_stats(), stats);
    }

    #[tokio::test]
    async fn test_persist_throttles_within_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), "s3");
        let memory = seeded_memory();

        assert!(store.persist(&memory, "first").await.unwrap());
        // Immediately after a write, the throttle suppresses the next one.
        assert!(!store.persist(&memory, "second").await.unwrap());
    }

    #[tokio::test]
    async fn test_load_latest_missing_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(SessionStore::load_latest(&missing).await.unwrap().is_none());
    }
}
