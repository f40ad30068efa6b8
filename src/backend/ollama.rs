//! Ollama-style quality-tier adapter.
//!
//! Uses the native endpoints: `POST /api/generate` for completions
//! (NDJSON when streamed), `GET /api/tags` for model listing, and
//! `POST /api/pull` (streamed) for fetching a missing model. Chat
//! conversations are rendered into a single transcript prompt.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

use super::types::{
    BackendResponse, BackendTier, ChatMessage, ChatRole, GenerateOptions, ModelInfo, StreamChunk,
    TokenUsage,
};
use super::{classify_status, BackendAdapter, ChunkStream};
use crate::error::{Error, Result};

/// Adapter for a locally-running Ollama-style inference server.
pub struct OllamaAdapter {
    id: String,
    base_url: String,
    /// Buffered requests carry the configured timeout.
    http: Client,
    /// Streaming requests have no request-level timeout.
    stream_http: Client,
    timeout_ms: u64,
    max_concurrent: usize,
    preferred: Vec<String>,
}

impl OllamaAdapter {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, timeout_ms: u64) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        let stream_http = Client::builder().build().unwrap_or_default();

        Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            stream_http,
            timeout_ms,
            max_concurrent: 2,
            preferred: vec!["qwen2.5-coder:14b".to_string(), "llama3.1:8b".to_string()],
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_preferred_models(mut self, models: Vec<String>) -> Self {
        self.preferred = models;
        self
    }

    fn map_transport_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::timeout(self.timeout_ms)
        } else {
            Error::network(format!("{}: {}", self.id, err))
        }
    }

    fn model_for(&self, options: &GenerateOptions) -> String {
        options
            .model
            .clone()
            .or_else(|| self.preferred.first().cloned())
            .unwrap_or_else(|| "auto".to_string())
    }

    fn build_request(&self, prompt: &str, options: &GenerateOptions, stream: bool) -> ApiRequest {
        ApiRequest {
            model: self.model_for(options),
            prompt: prompt.to_string(),
            stream,
            options: ApiOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
                top_p: options.top_p,
                stop: if options.stop.is_empty() {
                    None
                } else {
                    Some(options.stop.clone())
                },
            },
        }
    }

    /// Render a conversation into a single transcript prompt.
    fn render_transcript(messages: &[ChatMessage]) -> String {
        let mut prompt = String::new();
        for message in messages {
            let prefix = match message.role {
                ChatRole::System => "[system]",
                ChatRole::User => "[user]",
                ChatRole::Assistant => "[assistant]",
                ChatRole::Tool => "[tool result]",
            };
            prompt.push_str(prefix);
            prompt.push(' ');
            prompt.push_str(&message.content);
            prompt.push('\n');
        }
        prompt.push_str("[assistant] ");
        prompt
    }

    /// Pull a model onto the backend, draining the streamed status lines.
    pub async fn pull_model(&self, name: &str) -> Result<()> {
        let url = format!("{}/api/pull", self.base_url);
        let response = self
            .stream_http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.id, status.as_u16(), &body, None));
        }

        #[derive(Deserialize)]
        struct PullStatus {
            #[serde(default)]
            status: String,
            #[serde(default)]
            error: Option<String>,
        }

        let mut bytes = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(data) = bytes.next().await {
            let data = data.map_err(|e| Error::network(format!("{}: {}", self.id, e)))?;
            buffer.push_str(&String::from_utf8_lossy(&data));
            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let status: PullStatus = serde_json::from_str(line)
                    .map_err(|e| Error::Parsing(format!("pull status: {}", e)))?;
                if let Some(err) = status.error {
                    return Err(Error::api(&self.id, format!("pull failed: {}", err), None));
                }
                if status.status == "success" {
                    info!(backend = %self.id, model = name, "model pulled");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

// Wire types for the Ollama-style surface.

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: ApiOptions,
}

#[derive(Debug, Serialize)]
struct ApiOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[async_trait]
impl BackendAdapter for OllamaAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn tier(&self) -> BackendTier {
        BackendTier::Quality
    }

    fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn preferred_models(&self) -> &[String] {
        &self.preferred
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<BackendResponse> {
        let api_request = self.build_request(prompt, options, false);
        let url = format!("{}/api/generate", self.base_url);
        let started = Instant::now();

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !status.is_success() {
            return Err(classify_status(&self.id, status.as_u16(), &body, None));
        }

        let api_response: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Parsing(format!("{} response: {}", self.id, e)))?;

        Ok(BackendResponse {
            backend_id: self.id.clone(),
            model: api_response.model,
            content: api_response.response,
            usage: TokenUsage {
                input_tokens: api_response.prompt_eval_count.unwrap_or(0),
                output_tokens: api_response.eval_count.unwrap_or(0),
            },
            tool_call: None,
            latency_ms: started.elapsed().as_millis() as u64,
            finished_at: Utc::now(),
        })
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<BackendResponse> {
        let prompt = Self::render_transcript(messages);
        self.generate(&prompt, options).await
    }

    async fn stream(&self, prompt: &str, options: &GenerateOptions) -> Result<ChunkStream> {
        let api_request = self.build_request(prompt, options, true);
        let url = format!("{}/api/generate", self.base_url);

        let response = self
            .stream_http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.id, status.as_u16(), &body, None));
        }

        let backend = self.id.clone();
        let bytes = response.bytes_stream();
        let stream = futures::stream::try_unfold(
            (bytes, String::new(), false),
            move |(mut bytes, mut buffer, finished)| {
                let backend = backend.clone();
                async move {
                    if finished {
                        return Ok(None);
                    }
                    loop {
                        if let Some(pos) = buffer.find('\n') {
                            let line: String = buffer.drain(..=pos).collect();
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            let parsed: ApiResponse = serde_json::from_str(line)
                                .map_err(|e| Error::Parsing(format!("stream line: {}", e)))?;
                            let chunk = StreamChunk {
                                content: parsed.response,
                                done: parsed.done,
                            };
                            let done = chunk.done;
                            return Ok(Some((chunk, (bytes, buffer, done))));
                        }
                        match bytes.next().await {
                            Some(Ok(data)) => {
                                buffer.push_str(&String::from_utf8_lossy(&data));
                            }
                            Some(Err(e)) => {
                                return Err(Error::network(format!("{}: {}", backend, e)));
                            }
                            None => {
                                let chunk = StreamChunk {
                                    content: String::new(),
                                    done: true,
                                };
                                return Ok(Some((chunk, (bytes, buffer, true))));
                            }
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !status.is_success() {
            return Err(classify_status(&self.id, status.as_u16(), &body, None));
        }

        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            models: Vec<TagEntry>,
        }
        #[derive(Deserialize)]
        struct TagEntry {
            name: String,
            #[serde(default)]
            size: Option<u64>,
            #[serde(default)]
            details: Option<TagDetails>,
        }
        #[derive(Deserialize)]
        struct TagDetails {
            #[serde(default)]
            family: Option<String>,
        }

        let list: TagList = serde_json::from_str(&body)
            .map_err(|e| Error::Parsing(format!("{} tag list: {}", self.id, e)))?;
        Ok(list
            .models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.name,
                size: m.size,
                family: m.details.and_then(|d| d.family),
            })
            .collect())
    }

    async fn health(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_rendering() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi"),
            ChatMessage::user("explain"),
        ];
        let prompt = OllamaAdapter::render_transcript(&messages);

        assert!(prompt.starts_with("[system] be brief\n"));
        assert!(prompt.contains("[user] hello\n"));
        assert!(prompt.ends_with("[assistant] "));
    }

    #[test]
    fn test_request_body_shape() {
        let adapter = OllamaAdapter::new("quality", "http://localhost:11434", 30_000);
        let request = adapter.build_request(
            "prove it",
            &GenerateOptions::new()
                .with_model("llama3.1:8b")
                .with_temperature(0.2)
                .with_max_tokens(256),
            false,
        );
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "llama3.1:8b");
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["temperature"], 0.2);
        assert_eq!(json["options"]["num_predict"], 256);
        assert!(json["options"].get("stop").is_none());
    }

    #[test]
    fn test_tier_is_quality() {
        let adapter = OllamaAdapter::new("q", "http://x", 1_000);
        assert_eq!(adapter.tier(), BackendTier::Quality);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let adapter = OllamaAdapter::new("q", "http://localhost:11434/", 1_000);
        assert_eq!(adapter.base_url, "http://localhost:11434");
    }
}
