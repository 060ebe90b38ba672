//! Scriptable mock backend for tests.
//!
//! Shipped as a regular module (not `cfg(test)`) so the server crate's
//! integration tests can drive the full file tree against deterministic
//! responses, stream scripts, and injected failures.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::chat::ChatState;
use crate::limits::estimate_tokens;
use crate::{Backend, LlmError, LlmResult, Message};

#[derive(Default)]
struct Knobs {
    ask_response: String,
    ask_error: Option<String>,
    compact_error: Option<String>,
    compact_called: bool,
    last_history: Vec<Message>,
    stream_chunks: Vec<String>,
    stream_error: Option<String>,
    context_limit: u64,
}

/// A backend whose every answer is scripted by the test.
pub struct MockBackend {
    chat: Arc<ChatState>,
    knobs: Mutex<Knobs>,
}

impl MockBackend {
    /// New mock with a 200000-token context limit and no scripted state.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            chat: ChatState::new("mock-model", 0),
            knobs: Mutex::new(Knobs {
                context_limit: 200_000,
                ..Knobs::default()
            }),
        })
    }

    /// Script the response every ask returns until changed.
    pub fn set_ask_response(&self, response: &str) {
        let mut knobs = self.knobs.lock();
        knobs.ask_response = response.to_string();
        knobs.ask_error = None;
    }

    /// Make every ask fail with this message.
    pub fn set_ask_error(&self, message: &str) {
        self.knobs.lock().ask_error = Some(message.to_string());
    }

    /// Make compaction fail with this message.
    pub fn set_compact_error(&self, message: &str) {
        self.knobs.lock().compact_error = Some(message.to_string());
    }

    /// Whether compact was invoked since construction.
    pub fn compact_called(&self) -> bool {
        self.knobs.lock().compact_called
    }

    /// Override the reported context limit.
    pub fn set_context_limit(&self, limit: u64) {
        self.knobs.lock().context_limit = limit;
    }

    /// Seed the cumulative token counter.
    pub fn set_total_tokens(&self, tokens: u64) {
        self.chat.reset();
        self.chat.record_usage(tokens);
    }

    /// History snapshot passed to the most recent `ask_with_history`.
    pub fn last_history(&self) -> Vec<Message> {
        self.knobs.lock().last_history.clone()
    }

    /// Script the chunks the next stream will produce.
    pub fn set_stream_chunks(&self, chunks: &[&str]) {
        self.knobs.lock().stream_chunks = chunks.iter().map(|s| s.to_string()).collect();
    }

    /// Make the next stream fail before producing content.
    pub fn set_stream_error(&self, message: &str) {
        let mut knobs = self.knobs.lock();
        knobs.stream_chunks.clear();
        knobs.stream_error = Some(message.to_string());
    }
}

#[async_trait]
impl Backend for MockBackend {
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
        self.knobs.lock().context_limit
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
        let response = {
            let knobs = self.knobs.lock();
            if let Some(msg) = &knobs.ask_error {
                return Err(LlmError::Api(msg.clone()));
            }
            knobs.ask_response.clone()
        };

        self.chat.push_user(prompt);
        self.chat.push_assistant(&response);
        self.chat
            .record_usage(estimate_tokens(prompt) + estimate_tokens(&response));
        Ok(response)
    }

    async fn ask_with_history(
        &self,
        history: &[Message],
        prompt: &str,
    ) -> LlmResult<(String, u64)> {
        let response = {
            let mut knobs = self.knobs.lock();
            knobs.last_history = history.to_vec();
            if let Some(msg) = &knobs.ask_error {
                return Err(LlmError::Api(msg.clone()));
            }
            knobs.ask_response.clone()
        };

        let prefill = self.chat.prefill();
        let response = if prefill.is_empty() {
            response
        } else {
            format!("{prefill}{response}")
        };

        let tokens = estimate_tokens(prompt) + estimate_tokens(&response);
        Ok((response, tokens))
    }

    async fn compact(&self) -> LlmResult<()> {
        {
            let mut knobs = self.knobs.lock();
            knobs.compact_called = true;
            if let Some(msg) = &knobs.compact_error {
                return Err(LlmError::Api(msg.clone()));
            }
        }
        let compacted = self.chat.total_tokens() / 4;
        self.chat.replace_with_summary("compacted summary", compacted);
        Ok(())
    }

    async fn start_stream(&self, prompt: &str) -> LlmResult<()> {
        let producer = self.chat.stream.begin().await?;

        let (chunks, error) = {
            let knobs = self.knobs.lock();
            (knobs.stream_chunks.clone(), knobs.stream_error.clone())
        };

        self.chat.push_user(prompt);

        let chat = self.chat.clone();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            let mut full = String::new();
            for chunk in chunks {
                full.push_str(&chunk);
                let sent = tokio::select! {
                    _ = producer.cancel.cancelled() => false,
                    result = producer.tx.send(chunk) => result.is_ok(),
                };
                if !sent {
                    break;
                }
            }

            if full.is_empty() {
                if let Some(msg) = error {
                    let _ = producer.tx.send(format!("[Error: {msg}]")).await;
                }
                chat.pop_last();
            } else {
                let tokens = estimate_tokens(&prompt) + estimate_tokens(&full);
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

    #[tokio::test]
    async fn test_scripted_ask() {
        let mock = MockBackend::shared();
        mock.set_ask_response("pong");

        let (response, tokens) = mock.ask_with_history(&[], "ping").await.unwrap();
        assert_eq!(response, "pong");
        assert!(tokens > 0);
    }

    #[tokio::test]
    async fn test_scripted_stream() {
        let mock = MockBackend::shared();
        mock.set_stream_chunks(&["a", "b", "c"]);

        mock.start_stream("go").await.unwrap();
        let mut out = String::new();
        while let Some(chunk) = mock.read_stream_chunk().await {
            out.push_str(&chunk);
        }
        assert_eq!(out, "abc");

        mock.wait_stream().await;
        assert!(!mock.is_streaming());
        // Committed to the global conversation.
        let messages = mock.messages();
        assert_eq!(messages.last().unwrap().content, "abc");
    }

    #[tokio::test]
    async fn test_stream_error_marker() {
        let mock = MockBackend::shared();
        mock.set_stream_error("no backend");

        mock.start_stream("go").await.unwrap();
        let chunk = mock.read_stream_chunk().await.unwrap();
        assert_eq!(chunk, "[Error: no backend]");
        assert_eq!(mock.read_stream_chunk().await, None);

        mock.wait_stream().await;
        // Failed stream leaves no transcript behind.
        assert!(mock.messages().is_empty());
    }

    #[tokio::test]
    async fn test_stream_cancellation_stops_producer() {
        let mock = MockBackend::shared();
        let chunks: Vec<String> = (0..150).map(|i| format!("{i}")).collect();
        let refs: Vec<&str> = chunks.iter().map(|s| s.as_str()).collect();
        mock.set_stream_chunks(&refs);

        mock.start_stream("go").await.unwrap();
        assert!(mock.is_streaming());

        // Producer is parked on a full queue; cancellation aborts the
        // pending send and releases the slot.
        mock.chat.stream.cancel();
        mock.wait_stream().await;
        assert!(!mock.is_streaming());

        // Whatever was queued before the cancel drains, then EOF.
        while mock.read_stream_chunk().await.is_some() {}
        assert_eq!(mock.read_stream_chunk().await, None);
    }

    #[tokio::test]
    async fn test_mock_compact() {
        let mock = MockBackend::shared();
        mock.set_total_tokens(180_000);
        mock.compact().await.unwrap();
        assert!(mock.compact_called());
        assert_eq!(mock.total_tokens(), 45_000);
        assert_eq!(mock.messages().len(), 1);
    }
}
