//! Backend adapters over inference providers.
//!
//! Every provider is reached through the same [`BackendAdapter`] contract:
//! generate, chat, stream, list-models, health. Two conforming adapters
//! ship with the crate — an OpenAI-compatible speed-tier service and an
//! Ollama-style quality-tier service. Protocol differences stay inside
//! the adapter modules; routing code never sees them.

mod health;
mod ollama;
mod openai;
mod types;

pub use health::{HealthCache, HealthEntry, HEALTH_TTL_SECS};
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use types::{
    BackendResponse, BackendTier, ChatMessage, ChatRole, GenerateOptions, ModelInfo, StreamChunk,
    TokenUsage, ToolCall, ToolSpec,
};

use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A boxed stream of generation chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Uniform contract over one inference backend.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Stable identifier for this backend instance.
    fn id(&self) -> &str;

    /// Latency/quality tier this backend serves.
    fn tier(&self) -> BackendTier;

    /// Concurrency limit for in-flight requests.
    fn max_concurrent(&self) -> usize;

    /// Models this backend prefers when several are loaded.
    fn preferred_models(&self) -> &[String];

    /// Complete a single prompt.
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<BackendResponse>;

    /// Complete a conversation.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<BackendResponse>;

    /// Stream a completion as a lazy, finite sequence of chunks.
    async fn stream(&self, prompt: &str, options: &GenerateOptions) -> Result<ChunkStream>;

    /// List models currently available on the backend.
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    /// Liveness probe. Must be cheap; results are cached by [`HealthCache`].
    async fn health(&self) -> bool;
}

/// Map an HTTP failure status onto the error taxonomy.
///
/// 5xx is treated as transient (Network kind, retryable); 401/403 are
/// terminal authentication failures; 429 is retryable rate limiting;
/// 400 is invalid input.
pub(crate) fn classify_status(
    backend: &str,
    status: u16,
    body: &str,
    retry_after_ms: Option<u64>,
) -> Error {
    match status {
        401 | 403 => Error::Authentication(format!("{}: HTTP {}", backend, status)),
        429 => Error::rate_limit(format!("{}: {}", backend, body), retry_after_ms),
        400 => Error::validation(format!("{} rejected request: {}", backend, body)),
        s if s >= 500 => Error::network(format!("{} returned HTTP {}: {}", backend, s, body)),
        s => Error::api(backend, body, Some(s)),
    }
}

/// Short built-in list probed when a backend reports no loaded models.
const FALLBACK_MODELS: &[&str] = &["qwen2.5-coder:7b", "llama3.2:3b", "phi3:mini"];

/// Session-scoped model auto-selection.
///
/// The first "auto" request against a backend resolves a concrete model
/// (coding-specialized by substring match, else first loaded, else the
/// first fallback that answers a probe) and caches it for the session.
#[derive(Default)]
pub struct ModelSelector {
    chosen: RwLock<HashMap<String, String>>,
}

impl ModelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the model to use for `adapter`.
    pub async fn resolve(
        &self,
        adapter: &dyn BackendAdapter,
        requested: Option<&str>,
    ) -> Result<String> {
        if let Some(model) = requested {
            if model != "auto" {
                return Ok(model.to_string());
            }
        }

        if let Some(cached) = self.chosen.read().await.get(adapter.id()) {
            return Ok(cached.clone());
        }

        let resolved = self.pick(adapter).await?;
        info!(backend = adapter.id(), model = %resolved, "auto-selected model");
        self.chosen
            .write()
            .await
            .insert(adapter.id().to_string(), resolved.clone());
        Ok(resolved)
    }

    async fn pick(&self, adapter: &dyn BackendAdapter) -> Result<String> {
        let loaded = adapter.list_models().await.unwrap_or_default();

        // Prefer a coding-specialized model among whatever is loaded.
        if let Some(coder) = loaded
            .iter()
            .find(|m| m.id.contains("coder") || m.id.contains("code"))
        {
            return Ok(coder.id.clone());
        }
        if let Some(first) = loaded.first() {
            return Ok(first.id.clone());
        }

        // Nothing loaded: probe the fallback list and take the first that
        // actually answers.
        let probe_opts = GenerateOptions::new().with_max_tokens(1);
        for candidate in FALLBACK_MODELS {
            let opts = probe_opts.clone().with_model(*candidate);
            match adapter.generate("ping", &opts).await {
                Ok(_) => return Ok((*candidate).to_string()),
                Err(err) => {
                    debug!(backend = adapter.id(), model = candidate, error = %err, "fallback probe failed");
                }
            }
        }

        Err(Error::NoBackendAvailable(format!(
            "backend {} has no loaded models and no fallback responded",
            adapter.id()
        )))
    }

    /// Drop the cached choice for a backend (e.g. after it restarts).
    pub async fn invalidate(&self, backend_id: &str) {
        self.chosen.write().await.remove(backend_id);
    }
}

/// Registry of adapters keyed by id.
#[derive(Default)]
pub struct BackendRegistry {
    adapters: HashMap<String, Arc<dyn BackendAdapter>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own id.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn BackendAdapter>> {
        self.adapters.get(id)
    }

    /// All adapters serving a tier.
    pub fn by_tier(&self, tier: BackendTier) -> Vec<&Arc<dyn BackendAdapter>> {
        self.adapters
            .values()
            .filter(|a| a.tier() == tier)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn BackendAdapter>> {
        self.adapters.values()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-crate mock adapter used by scenario tests across modules.

    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scriptable adapter for tests: fixed reply, fail toggle, call count.
    pub struct MockAdapter {
        pub id: String,
        pub tier: BackendTier,
        pub reply: String,
        pub healthy: AtomicBool,
        pub fail_with: std::sync::Mutex<Option<fn() -> Error>>,
        pub calls: AtomicUsize,
        pub health_calls: AtomicUsize,
        pub models: Vec<ModelInfo>,
        preferred: Vec<String>,
        pub delay: Option<std::time::Duration>,
    }

    impl MockAdapter {
        pub fn new(id: &str, tier: BackendTier, reply: &str) -> Self {
            Self {
                id: id.to_string(),
                tier,
                reply: reply.to_string(),
                healthy: AtomicBool::new(true),
                fail_with: std::sync::Mutex::new(None),
                calls: AtomicUsize::new(0),
                health_calls: AtomicUsize::new(0),
                models: vec![ModelInfo {
                    id: "mock-model".into(),
                    size: None,
                    family: None,
                }],
                preferred: vec!["mock-model".to_string()],
                delay: None,
            }
        }

        pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
            self.models = models;
            self
        }

        pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn set_failure(&self, f: fn() -> Error) {
            *self.fail_with.lock().unwrap() = Some(f);
        }

        fn respond(&self, model: &str) -> Result<BackendResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(f) = *self.fail_with.lock().unwrap() {
                return Err(f());
            }
            Ok(BackendResponse {
                backend_id: self.id.clone(),
                model: model.to_string(),
                content: self.reply.clone(),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 20,
                },
                tool_call: None,
                latency_ms: 5,
                finished_at: Utc::now(),
            })
        }
    }

    #[async_trait]
    impl BackendAdapter for MockAdapter {
        fn id(&self) -> &str {
            &self.id
        }

        fn tier(&self) -> BackendTier {
            self.tier
        }

        fn max_concurrent(&self) -> usize {
            3
        }

        fn preferred_models(&self) -> &[String] {
            &self.preferred
        }

        async fn generate(
            &self,
            _prompt: &str,
            options: &GenerateOptions,
        ) -> Result<BackendResponse> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.respond(options.model.as_deref().unwrap_or("mock-model"))
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            options: &GenerateOptions,
        ) -> Result<BackendResponse> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.respond(options.model.as_deref().unwrap_or("mock-model"))
        }

        async fn stream(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<ChunkStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(f) = *self.fail_with.lock().unwrap() {
                return Err(f());
            }
            let words: Vec<_> = self
                .reply
                .split_whitespace()
                .map(|w| {
                    Ok(StreamChunk {
                        content: format!("{} ", w),
                        done: false,
                    })
                })
                .chain(std::iter::once(Ok(StreamChunk {
                    content: String::new(),
                    done: true,
                })))
                .collect();
            Ok(Box::pin(futures::stream::iter(words)))
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>> {
            Ok(self.models.clone())
        }

        async fn health(&self) -> bool {
            self.health_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.healthy.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockAdapter;
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status("b", 401, "no", None),
            Error::Authentication(_)
        ));
        assert!(matches!(
            classify_status("b", 429, "slow", Some(500)),
            Error::RateLimit { .. }
        ));
        assert!(classify_status("b", 502, "bad gateway", None).is_retryable());
        assert!(!classify_status("b", 400, "bad input", None).is_retryable());
        assert!(matches!(
            classify_status("b", 404, "gone", None),
            Error::Api { status: Some(404), .. }
        ));
    }

    #[tokio::test]
    async fn test_auto_selection_prefers_coder() {
        let adapter = MockAdapter::new("speed", BackendTier::Speed, "hi").with_models(vec![
            ModelInfo {
                id: "llama3.2:3b".into(),
                size: None,
                family: None,
            },
            ModelInfo {
                id: "qwen2.5-coder:7b".into(),
                size: None,
                family: None,
            },
        ]);

        let selector = ModelSelector::new();
        let model = selector.resolve(&adapter, Some("auto")).await.unwrap();
        assert_eq!(model, "qwen2.5-coder:7b");
    }

    #[tokio::test]
    async fn test_auto_selection_cached_per_session() {
        let adapter = MockAdapter::new("speed", BackendTier::Speed, "hi");
        let selector = ModelSelector::new();

        let first = selector.resolve(&adapter, None).await.unwrap();
        let second = selector.resolve(&adapter, None).await.unwrap();
        assert_eq!(first, second);

        selector.invalidate("speed").await;
        let third = selector.resolve(&adapter, None).await.unwrap();
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn test_explicit_model_bypasses_selection() {
        let adapter = MockAdapter::new("q", BackendTier::Quality, "hi");
        let selector = ModelSelector::new();
        let model = selector.resolve(&adapter, Some("mistral:7b")).await.unwrap();
        assert_eq!(model, "mistral:7b");
    }

    #[tokio::test]
    async fn test_registry_by_tier() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(MockAdapter::new("s1", BackendTier::Speed, "a")));
        registry.register(Arc::new(MockAdapter::new("q1", BackendTier::Quality, "b")));

        assert_eq!(registry.by_tier(BackendTier::Speed).len(), 1);
        assert_eq!(registry.by_tier(BackendTier::Quality).len(), 1);
        assert!(registry.get("s1").is_some());
        assert!(registry.get("nope").is_none());
    }
}
