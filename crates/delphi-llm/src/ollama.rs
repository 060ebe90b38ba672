//! Ollama backend for local inference.
//!
//! Talks to an Ollama daemon's `/api/chat` endpoint. Unlike the Anthropic
//! wire format, Ollama accepts `system` messages inline, so history maps
//! directly. The context limit is asked of the daemon itself
//! (`/api/show`) with a static per-family fallback; token counts use the
//! reported eval counters when present.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::chat::{transcript_for_summary, summary_tokens, ChatState, Settings};
use crate::limits::{estimate_tokens, local_context_limit};
use crate::{auto_compact_if_needed, Backend, LlmError, LlmResult, Message};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2";
/// Local generation can be slow; give requests a generous ceiling.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Backend over a local Ollama daemon.
pub struct OllamaBackend {
    http: reqwest::Client,
    base_url: String,
    chat: Arc<ChatState>,
}

impl OllamaBackend {
    /// New backend; an empty `base_url` selects the default daemon address.
    pub fn new(base_url: &str) -> Self {
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url
        };
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            chat: ChatState::new(DEFAULT_MODEL, 0),
        }
    }

    /// Ollama-format message array: the dedicated system prompt first,
    /// then history verbatim, then the optional trailing user prompt.
    fn build_messages(settings: &Settings, history: &[Message], prompt: Option<&str>) -> Vec<Value> {
        let mut messages = Vec::new();
        if !settings.system_prompt.is_empty() {
            messages.push(json!({ "role": "system", "content": settings.system_prompt }));
        }
        for msg in history {
            messages.push(json!({ "role": msg.role.as_str(), "content": msg.content }));
        }
        if let Some(prompt) = prompt {
            messages.push(json!({ "role": "user", "content": prompt }));
        }
        messages
    }

    fn chat_body(settings: &Settings, messages: Vec<Value>, stream: bool) -> Value {
        json!({
            "model": settings.model,
            "messages": messages,
            "stream": stream,
            "options": { "temperature": settings.temperature },
        })
    }

    /// One blocking chat round trip: response text plus token usage.
    async fn complete(&self, body: Value) -> LlmResult<(String, u64)> {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
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

        let text = data["message"]["content"].as_str().unwrap_or("").to_string();
        let tokens = reported_tokens(&data).unwrap_or_else(|| estimate_tokens(&text));
        Ok((text, tokens))
    }

    /// Ask the daemon for the model's context length.
    async fn query_context_limit(&self, model: &str) -> Option<u64> {
        let response = self
            .http
            .post(format!("{}/api/show", self.base_url))
            .json(&json!({ "name": model }))
            .send()
            .await
            .ok()?;

        let data: Value = response.json().await.ok()?;
        data["model_info"]["context_length"].as_u64().filter(|&n| n > 0)
    }
}

/// Sum of the prompt and generation eval counters, if the daemon sent any.
fn reported_tokens(data: &Value) -> Option<u64> {
    let prompt = data["prompt_eval_count"].as_u64();
    let eval = data["eval_count"].as_u64();
    match (prompt, eval) {
        (None, None) => None,
        (p, e) => Some(p.unwrap_or(0) + e.unwrap_or(0)),
    }
}

#[async_trait]
impl Backend for OllamaBackend {
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

    /// Stored for interface parity; Ollama has no thinking budget.
    fn thinking_tokens(&self) -> i64 {
        self.chat.thinking_tokens()
    }

    fn set_thinking_tokens(&self, tokens: i64) {
        self.chat.set_thinking_tokens(tokens);
    }

    /// Stored for interface parity; applied post hoc like the CLI path.
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
        let model = self.chat.model();
        match self.query_context_limit(&model).await {
            Some(limit) => limit,
            None => local_context_limit(&model),
        }
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
        let messages = Self::build_messages(&settings, &self.chat.messages(), None);
        let body = Self::chat_body(&settings, messages, false);

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
        let messages = Self::build_messages(&settings, history, Some(prompt));
        let body = Self::chat_body(&settings, messages, false);
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
        let body = Self::chat_body(
            &settings,
            vec![json!({ "role": "user", "content": summary_prompt })],
            false,
        );

        let (summary, _) = self
            .complete(body)
            .await
            .map_err(|e| LlmError::Api(format!("compaction failed: {e}")))?;

        self.chat
            .replace_with_summary(&summary, summary_tokens(&summary));
        Ok(())
    }

    async fn start_stream(&self, prompt: &str) -> LlmResult<()> {
        let producer = self.chat.stream.begin().await?;

        self.chat.push_user(prompt);
        let settings = self.chat.settings();
        let messages = Self::build_messages(&settings, &self.chat.messages(), None);
        let body = Self::chat_body(&settings, messages, true);

        let request = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&body);

        let chat = self.chat.clone();
        tokio::spawn(async move {
            let mut full = String::new();
            let mut tokens: Option<u64> = None;
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
                            if line.is_empty() {
                                continue;
                            }

                            let Ok(event) = serde_json::from_str::<Value>(&line) else {
                                continue;
                            };
                            if let Some(text) = event["message"]["content"].as_str() {
                                if !text.is_empty() {
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
                            if event["done"].as_bool() == Some(true) {
                                tokens = reported_tokens(&event);
                                break 'outer;
                            }
                            if let Some(err) = event["error"].as_str() {
                                failure = Some(err.to_string());
                                break 'outer;
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
                let tokens = tokens.unwrap_or_else(|| estimate_tokens(&full));
                chat.commit_stream(&full, tokens);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_messages_keeps_system_inline() {
        let settings = Settings {
            model: "llama3.2".into(),
            temperature: 0.7,
            system_prompt: "lead".into(),
            prefill: String::new(),
            thinking_tokens: 0,
        };
        let history = vec![Message::system("ctx"), Message::user("q")];
        let messages = OllamaBackend::build_messages(&settings, &history, Some("next"));

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "lead");
        assert_eq!(messages[1]["role"], "system");
        assert_eq!(messages[1]["content"], "ctx");
        assert_eq!(messages[3]["role"], "user");
        assert_eq!(messages[3]["content"], "next");
    }

    #[test]
    fn test_chat_body_carries_temperature() {
        let settings = Settings {
            model: "llama3.2".into(),
            temperature: 0.3,
            system_prompt: String::new(),
            prefill: String::new(),
            thinking_tokens: 0,
        };
        let body = OllamaBackend::chat_body(&settings, vec![], true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["temperature"], 0.3);
    }

    #[test]
    fn test_reported_tokens() {
        let data = json!({ "prompt_eval_count": 10, "eval_count": 32 });
        assert_eq!(reported_tokens(&data), Some(42));

        let partial = json!({ "eval_count": 5 });
        assert_eq!(reported_tokens(&partial), Some(5));

        assert_eq!(reported_tokens(&json!({})), None);
    }

    #[test]
    fn test_base_url_normalisation() {
        let backend = OllamaBackend::new("http://box:11434/");
        assert_eq!(backend.base_url, "http://box:11434");

        let default = OllamaBackend::new("");
        assert_eq!(default.base_url, DEFAULT_BASE_URL);
    }
}
