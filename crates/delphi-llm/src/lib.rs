//! LLM backend abstraction for the delphi file server.
//!
//! This crate provides a unified [`Backend`] trait that the file tree
//! programs against, three concrete implementations (Anthropic HTTP,
//! Claude CLI subprocess, Ollama HTTP), per-fid conversation isolation
//! via [`SessionManager`], and the chunked streaming pipeline.
//!
//! ## Two conversation scopes
//!
//! Every backend owns one *global* conversation (used by streaming and
//! compaction) and exposes [`Backend::ask_with_history`], which is
//! stateless with respect to that conversation. The session manager
//! builds per-fid isolation on top of the stateless call: it snapshots a
//! session's history, dispatches, and appends to the session only on
//! success.

pub mod chat;
pub mod limits;
pub mod session;
pub mod testing;

mod anthropic;
mod claude_cli;
mod ollama;

pub use anthropic::AnthropicBackend;
pub use chat::{ChatState, AUTO_COMPACT_THRESHOLD};
pub use claude_cli::CliBackend;
pub use ollama::OllamaBackend;
pub use session::{Session, SessionManager};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instruction injected ahead of the dialogue.
    System,
    /// Human/user message.
    User,
    /// Assistant/model message.
    Assistant,
}

impl Role {
    /// Lowercase label as used in transcripts and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message.
    pub role: Role,
    /// Message content.
    pub content: String,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Error type for LLM operations.
///
/// The `Display` strings are what clients see: node reads surface them
/// verbatim (prefixed `Error: `), and the `compact` file embeds them in
/// its `error: …` status line.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Temperature outside the accepted range.
    #[error("temperature must be between 0.0 and 2.0")]
    InvalidTemperature,

    /// Rejected empty model name.
    #[error("model name cannot be empty")]
    EmptyModel,

    /// A second stream was requested while one is running.
    #[error("stream already in progress")]
    StreamActive,

    /// HTTP API failure (Anthropic or Ollama), passed through.
    #[error("API error: {0}")]
    Api(String),

    /// Claude CLI subprocess failure, passed through.
    #[error("claude CLI error: {0}")]
    Cli(String),

    /// Anything else worth a message of its own.
    #[error("{0}")]
    Other(String),
}

/// Result type for LLM operations.
pub type LlmResult<T> = Result<T, LlmError>;

/// Capability set the file tree consumes.
///
/// Implementations must keep [`ask_with_history`](Backend::ask_with_history)
/// free of side effects on the global conversation — it is the primitive
/// that makes per-fid session isolation possible. Long calls are cancelled
/// by dropping the future; the stream producer additionally honours the
/// singleton's cancellation token.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Current model identifier.
    fn model(&self) -> String;

    /// Set the model for subsequent requests.
    fn set_model(&self, model: &str);

    /// Current sampling temperature.
    fn temperature(&self) -> f64;

    /// Set the temperature; rejects values outside [0.0, 2.0].
    fn set_temperature(&self, temp: f64) -> LlmResult<()>;

    /// Process-wide system prompt.
    fn system_prompt(&self) -> String;

    /// Replace the process-wide system prompt.
    fn set_system_prompt(&self, prompt: &str);

    /// Thinking token budget: −1 = maximum, 0 = disabled, >0 = exact.
    fn thinking_tokens(&self) -> i64;

    /// Set the thinking token budget.
    fn set_thinking_tokens(&self, tokens: i64);

    /// Assistant-response prefill string.
    fn prefill(&self) -> String;

    /// Set the assistant-response prefill.
    fn set_prefill(&self, prefill: &str);

    /// Token count of the last completed request.
    fn last_tokens(&self) -> u64;

    /// Cumulative token count since the last reset.
    fn total_tokens(&self) -> u64;

    /// Context window limit for the current model.
    async fn context_limit(&self) -> u64;

    /// Snapshot of the global conversation.
    fn messages(&self) -> Vec<Message>;

    /// Global conversation as pretty-printed JSON.
    fn messages_json(&self) -> LlmResult<String>;

    /// Prepend a system message to the global conversation.
    fn add_system_message(&self, content: &str);

    /// Clear the global conversation and counters.
    fn reset(&self);

    /// Send a prompt against the global conversation (blocking).
    ///
    /// Auto-compacts first when cumulative usage crosses
    /// [`AUTO_COMPACT_THRESHOLD`] of the context limit.
    async fn ask(&self, prompt: &str) -> LlmResult<String>;

    /// Send a prompt against caller-supplied history without touching the
    /// global conversation. Returns the response text and the tokens
    /// consumed by the exchange.
    async fn ask_with_history(&self, history: &[Message], prompt: &str)
        -> LlmResult<(String, u64)>;

    /// Collapse the global conversation into a single summary message.
    async fn compact(&self) -> LlmResult<()>;

    /// Begin streaming a response; fails if a stream is already active.
    async fn start_stream(&self, prompt: &str) -> LlmResult<()>;

    /// Next streamed chunk, blocking until one arrives. `None` once the
    /// producer has closed the queue.
    async fn read_stream_chunk(&self) -> Option<String>;

    /// Whether a stream is currently in progress.
    fn is_streaming(&self) -> bool;

    /// Wait for the current stream to complete.
    async fn wait_stream(&self);
}

/// Run auto-compaction if the backend's cumulative usage has crossed the
/// threshold. Failure is logged and swallowed; the caller's request
/// proceeds either way.
pub async fn auto_compact_if_needed(backend: &dyn Backend) {
    let total = backend.total_tokens();
    let limit = backend.context_limit().await;
    let threshold = (limit as f64 * AUTO_COMPACT_THRESHOLD) as u64;
    if total <= threshold {
        return;
    }

    tracing::info!(total, limit, "auto-compacting conversation");
    match backend.compact().await {
        Ok(()) => tracing::info!(total = backend.total_tokens(), "auto-compact complete"),
        Err(e) => tracing::warn!(error = %e, "auto-compact failed, continuing"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let user = Message::user("hello");
        assert_eq!(user.role, Role::User);
        assert_eq!(user.content, "hello");

        let assistant = Message::assistant("hi there");
        assert_eq!(assistant.role, Role::Assistant);

        let system = Message::system("be terse");
        assert_eq!(system.role, Role::System);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::user("x")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"x"}"#);
    }

    #[test]
    fn test_error_strings_match_wire_contract() {
        assert_eq!(
            LlmError::InvalidTemperature.to_string(),
            "temperature must be between 0.0 and 2.0"
        );
        assert_eq!(
            LlmError::StreamActive.to_string(),
            "stream already in progress"
        );
        assert_eq!(LlmError::Api("boom".into()).to_string(), "API error: boom");
        assert_eq!(
            LlmError::Cli("exit 1".into()).to_string(),
            "claude CLI error: exit 1"
        );
    }
}
