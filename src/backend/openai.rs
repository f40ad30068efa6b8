//! OpenAI-compatible speed-tier adapter.
//!
//! Talks to any service exposing `/v1/chat/completions` and `/v1/models`.
//! Streaming output arrives as newline-delimited `data:` lines; a
//! `[DONE]` marker (or a non-null finish reason) terminates the stream.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::types::{
    BackendResponse, BackendTier, ChatMessage, ChatRole, GenerateOptions, ModelInfo, StreamChunk,
    TokenUsage, ToolCall,
};
use super::{classify_status, BackendAdapter, ChunkStream};
use crate::error::{Error, Result};

/// Adapter for an OpenAI-compatible HTTP service.
pub struct OpenAiAdapter {
    id: String,
    base_url: String,
    api_key: Option<String>,
    /// Buffered requests carry the configured timeout.
    http: Client,
    /// Streaming requests have no request-level timeout.
    stream_http: Client,
    timeout_ms: u64,
    max_concurrent: usize,
    preferred: Vec<String>,
}

impl OpenAiAdapter {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout_ms: u64,
    ) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        let stream_http = Client::builder().build().unwrap_or_default();

        Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
            stream_http,
            timeout_ms,
            max_concurrent: 3,
            preferred: vec!["qwen2.5-coder:7b".to_string(), "llama3.2:3b".to_string()],
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

    fn request(&self, client: &Client, url: &str) -> reqwest::RequestBuilder {
        let mut builder = client.post(url).header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        builder
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

    fn build_request(&self, messages: &[ChatMessage], options: &GenerateOptions) -> ApiRequest {
        let messages = messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::Tool => "tool",
                }
                .to_string(),
                content: m.content.clone(),
            })
            .collect();

        let tools = if options.tools.is_empty() {
            None
        } else {
            Some(
                options
                    .tools
                    .iter()
                    .map(|t| ApiTool {
                        tool_type: "function".to_string(),
                        function: ApiFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        };

        ApiRequest {
            model: self.model_for(options),
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            stop: if options.stop.is_empty() {
                None
            } else {
                Some(options.stop.clone())
            },
            stream: options.stream,
            tools,
        }
    }

    async fn send_chat(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<BackendResponse> {
        let api_request = self.build_request(messages, options);
        let url = format!("{}/v1/chat/completions", self.base_url);
        let started = Instant::now();

        let response = self
            .request(&self.http, &url)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !status.is_success() {
            return Err(classify_status(&self.id, status.as_u16(), &body, retry_after));
        }

        let api_response: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Parsing(format!("{} response: {}", self.id, e)))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Parsing(format!("{}: no choices in response", self.id)))?;

        let tool_call = choice
            .message
            .tool_calls
            .and_then(|calls| calls.into_iter().next())
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::Null);
                ToolCall {
                    name: call.function.name,
                    arguments,
                }
            });

        Ok(BackendResponse {
            backend_id: self.id.clone(),
            model: api_response.model,
            content: choice.message.content.unwrap_or_default(),
            usage: api_response.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
            tool_call,
            latency_ms: started.elapsed().as_millis() as u64,
            finished_at: Utc::now(),
        })
    }
}

// Wire types for the OpenAI-compatible surface.

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    function: ApiToolCallFunction,
}

#[derive(Debug, Deserialize)]
struct ApiToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Parse one line of a streamed response into a chunk.
///
/// Accepts both raw NDJSON and SSE `data:`-prefixed lines.
fn parse_stream_line(line: &str) -> Result<Option<StreamChunk>> {
    let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if payload.is_empty() {
        return Ok(None);
    }
    if payload == "[DONE]" {
        return Ok(Some(StreamChunk {
            content: String::new(),
            done: true,
        }));
    }

    let delta: StreamDelta =
        serde_json::from_str(payload).map_err(|e| Error::Parsing(format!("stream line: {}", e)))?;
    let Some(choice) = delta.choices.into_iter().next() else {
        return Ok(None);
    };

    Ok(Some(StreamChunk {
        content: choice.delta.content.unwrap_or_default(),
        done: choice.finish_reason.is_some(),
    }))
}

#[async_trait]
impl BackendAdapter for OpenAiAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn tier(&self) -> BackendTier {
        BackendTier::Speed
    }

    fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn preferred_models(&self) -> &[String] {
        &self.preferred
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<BackendResponse> {
        let messages = [ChatMessage::user(prompt)];
        self.send_chat(&messages, options).await
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<BackendResponse> {
        self.send_chat(messages, options).await
    }

    async fn stream(&self, prompt: &str, options: &GenerateOptions) -> Result<ChunkStream> {
        let mut streamed = options.clone();
        streamed.stream = true;
        let api_request = self.build_request(&[ChatMessage::user(prompt)], &streamed);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .request(&self.stream_http, &url)
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
                            match parse_stream_line(line.trim())? {
                                Some(chunk) => {
                                    let done = chunk.done;
                                    return Ok(Some((chunk, (bytes, buffer, done))));
                                }
                                None => continue,
                            }
                        }
                        match bytes.next().await {
                            Some(Ok(data)) => {
                                buffer.push_str(&String::from_utf8_lossy(&data));
                            }
                            Some(Err(e)) => {
                                return Err(Error::network(format!("{}: {}", backend, e)));
                            }
                            None => {
                                // Source ended without an explicit marker.
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
        let url = format!("{}/v1/models", self.base_url);
        let mut builder = self.http.get(&url);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
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
        struct ModelList {
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        let list: ModelList = serde_json::from_str(&body)
            .map_err(|e| Error::Parsing(format!("{} model list: {}", self.id, e)))?;
        Ok(list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                size: None,
                family: None,
            })
            .collect())
    }

    async fn health(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
