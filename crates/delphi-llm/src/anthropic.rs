//! Anthropic Messages API backend.
//!
//! Speaks `POST /v1/messages` directly over `reqwest`. The dedicated
//! system prompt becomes the first system block, followed by any
//! system-role messages from history; user/assistant turns map one to
//! one. Token counts come from the reported usage. Streaming consumes
//! the SSE body and forwards `text_delta` events into the chunk queue.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::chat::{transcript_for_summary, ChatState, Settings};
use crate::{auto_compact_if_needed, limits, Backend, LlmError, LlmResult, Message, Role};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const MAX_TOKENS: u32 = 4096;
const SUMMARY_MAX_TOKENS: u32 = 2048;

/// Backend over the Anthropic HTTP API.
pub struct AnthropicBackend {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    chat: Arc<ChatState>,
}

impl AnthropicBackend {
    /// New backend with the given API key.
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// New backend against a non-default endpoint (proxies, tests).
    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            chat: ChatState::new(DEFAULT_MODEL, 0),
        }
    }

    /// Request body for the messages endpoint.
    ///
    /// `prompt`, when present, is appended as the final user turn.
    fn build_body(settings: &Settings, history: &[Message], prompt: Option<&str>) -> Value {
        let mut system_blocks = Vec::new();
        if !settings.system_prompt.is_empty() {
            system_blocks.push(json!({ "type": "text", "text": settings.system_prompt }));
        }

        let mut messages = Vec::new();
        for msg in history {
            match msg.role {
                Role::System => {
                    system_blocks.push(json!({ "type": "text", "text": msg.content }));
                }
                Role::User => messages.push(json!({ "role": "user", "content": msg.content })),
                Role::Assistant => {
                    messages.push(json!({ "role": "assistant", "content": msg.content }))
                }
            }
        }
        if let Some(prompt) = prompt {
            messages.push(json!({ "role": "user", "content": prompt }));
        }

        let mut body = json!({
            "model": settings.model,
            "max_tokens": MAX_TOKENS,
            "messages": messages,
            "temperature": settings.temperature,
        });
        if !system_blocks.is_empty() {
            body["system"] = Value::Array(system_blocks);
        }
        body
    }

    /// One blocking completion round trip: response text plus usage total.
    async fn complete(&self, body: Value) -> LlmResult<(String, u64)> {
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{status}: {text}")));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let text = collect_text(&data["content"]);
        let tokens = data["usage"]["input_tokens"].as_u64().unwrap_or(0)
            + data["usage"]["output_tokens"].as_u64().unwrap_or(0);
        Ok((text, tokens))
    }
}

/// Concatenate the `text` blocks of a content array.
fn collect_text(content: &Value) -> String {
    let mut out = String::new();
    if let Some(blocks) = content.as_array() {
        for block in blocks {
            if block["type"] == "text" {
                if let Some(text) = block["text"].as_str() {
                    out.push_str(text);
                }
            }
        }
    }
    out
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn model(&self) -> String {
        self.chat.model()
    }

    fn set_model(&self, model: &str) {
        self.chat.set_model(model);
    }

    fn temperature(&self) -> f64 {
        self.chat.temperature()
    }

    fn set_temperature(&self, temp: f64) -> LlmResult<()> {
        self.chat.set_temperature(temp)
    }

    fn system_prompt(&self) -> String {
        self.chat.system_prompt()
    }

    fn set_system_prompt(&self, prompt: &str) {
        self.chat.set_system_prompt(prompt);
    }

    /// Stored but not forwarded: extended thinking stays off on the API
    /// path for now.
    fn thinking_tokens(&self) -> i64 {
        self.chat.thinking_tokens()
    }

    fn set_thinking_tokens(&self, tokens: i64) {
        self.chat.set_thinking_tokens(tokens);
    }

    fn prefill(&self) -> String {
        self.chat.prefill()
    }

    fn set_prefill(&self, prefill: &str) {
        self.chat.set_prefill(prefill);
    }

    fn last_tokens(&self) -> u64 {
        self.chat.last_tokens()
    }

    fn total_tokens(&self) -> u64 {
        self.chat.total_tokens()
    }

    async fn context_limit(&self) -> u64 {
        limits::cloud_context_limit(&self.chat.model())
    }

    fn messages(&self) -> Vec<Message> {
        self.chat.messages()
    }

    fn messages_json(&self) -> LlmResult<String> {
        self.chat.messages_json()
    }

    fn add_system_message(&self, content: &str) {
        self.chat.add_system_message(content);
    }

    fn reset(&self) {
        self.chat.reset();
    }

    async fn ask(&self, prompt: &str) -> LlmResult<String> {
        auto_compact_if_needed(self).await;

        self.chat.push_user(prompt);
        let settings = self.chat.settings();
        let body = Self::build_body(&settings, &self.chat.messages(), None);

        match self.complete(body).await {
            Ok((text, tokens)) => {
                self.chat.push_assistant(&text);
                self.chat.record_usage(tokens);
                Ok(text)
            }
            Err(e) => {
                self.chat.pop_last();
                Err(e)
            }
        }
    }

    async fn ask_with_history(
        &self,
        history: &[Message],
        prompt: &str,
    ) -> LlmResult<(String, u64)> {
        let settings = self.chat.settings();
        let body = Self::build_body(&settings, history, Some(prompt));
        let (text, tokens) = self.complete(body).await?;

        let text = if settings.prefill.is_empty() {
            text
        } else {
            format!("{}{}", settings.prefill, text)
        };
        Ok((text, tokens))
    }

    async fn compact(&self) -> LlmResult<()> {
        let Some(summary_prompt) = transcript_for_summary(&self.chat.messages()) else {
            return Ok(());
        };

        let settings = self.chat.settings();
        let body = json!({
            "model": settings.model,
            "max_tokens": SUMMARY_MAX_TOKENS,
            "messages": [{ "role": "user", "content": summary_prompt }],
        });

        let (summary, tokens) = self
            .complete(body)
            .await
            .map_err(|e| LlmError::Api(format!("compaction failed: {e}")))?;

        self.chat.replace_with_summary(&summary, tokens);
        Ok(())
    }

    async fn start_stream(&self, prompt: &str) -> LlmResult<()> {
        let producer = self.chat.stream.begin().await?;

        self.chat.push_user(prompt);
        let settings = self.chat.settings();
        let mut body = Self::build_body(&settings, &self.chat.messages(), None);
        body["stream"] = Value::Bool(true);

        let request = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

        let chat = self.chat.clone();
        tokio::spawn(async move {
            let mut full = String::new();
            let mut input_tokens = 0u64;
            let mut output_tokens = 0u64;
            let mut failure: Option<String> = None;

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let mut body_stream = response.bytes_stream();
                    let mut buffer = String::new();

                    'outer: loop {
                        let item = tokio::select! {
                            _ = producer.cancel.cancelled() => break 'outer,
                            item = body_stream.next() => item,
                        };
                        let bytes = match item {
                            Some(Ok(bytes)) => bytes,
                            Some(Err(e)) => {
                                failure = Some(e.to_string());
                                break;
                            }
                            None => break,
                        };

                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer.drain(..=pos);

                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            let Ok(event) = serde_json::from_str::<Value>(data) else {
                                continue;
                            };

                            match event["type"].as_str() {
                                Some("message_start") => {
                                    input_tokens = event["message"]["usage"]["input_tokens"]
                                        .as_u64()
                                        .unwrap_or(0);
                                }
                                Some("content_block_delta") => {
                                    if event["delta"]["type"] == "text_delta" {
                                        if let Some(text) = event["delta"]["text"].as_str() {
                                            full.push_str(text);
                                            let sent = tokio::select! {
                                                _ = producer.cancel.cancelled() => false,
                                                result = producer.tx.send(text.to_string()) => {
                                                    result.is_ok()
                                                }
                                            };
                                            if !sent {
                                                break 'outer;
                                            }
                                        }
                                    }
                                }
                                Some("message_delta") => {
                                    if let Some(n) = event["usage"]["output_tokens"].as_u64() {
                                        output_tokens = n;
                                    }
                                }
                                Some("error") => {
                                    failure = Some(
                                        event["error"]["message"]
                                            .as_str()
                                            .unwrap_or("stream error")
                                            .to_string(),
                                    );
                                    break 'outer;
                                }
                                _ => {}
                            }
                        }
                    }
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    failure = Some(format!("{status}: {text}"));
                }
                Err(e) => failure = Some(e.to_string()),
            }

            if full.is_empty() {
                if let Some(msg) = failure {
                    let _ = producer.tx.send(format!("[Error: {msg}]")).await;
                }
                chat.pop_last();
            } else {
                chat.commit_stream(&full, input_tokens + output_tokens);
            }

            drop(producer);
            chat.stream.finish();
        });

        Ok(())
    }

    async fn read_stream_chunk(&self) -> Option<String> {
        self.chat.stream.next_chunk().await
    }

    fn is_streaming(&self) -> bool {
        self.chat.stream.is_active()
    }

    async fn wait_stream(&self) {
        self.chat.stream.wait().await;
    }
}
