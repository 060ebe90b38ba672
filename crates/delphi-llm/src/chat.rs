//! Shared conversation and stream state for backend implementations.
//!
//! Every concrete backend owns one [`ChatState`]: scalar settings behind a
//! reader-writer lock, the global conversation, token counters, and the
//! stream singleton. Locks here are never held across an await — callers
//! snapshot under the lock, release, then dispatch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{limits, LlmError, LlmResult, Message, Role};

/// Fraction of the context limit at which auto-compaction triggers.
pub const AUTO_COMPACT_THRESHOLD: f64 = 0.80;

/// Bounded capacity of the stream chunk queue.
pub const STREAM_QUEUE_DEPTH: usize = 100;

/// Prompt prepended to the transcript when summarising.
pub const SUMMARY_PROMPT: &str =
    "Summarize this conversation concisely, preserving key facts, decisions, \
     and context needed to continue:\n\n";

/// Prefix of the synthetic system message that replaces a compacted
/// transcript.
pub const SUMMARY_MESSAGE_PREFIX: &str = "Previous conversation summary: ";

/// Scalar settings shared across fids.
#[derive(Debug, Clone)]
pub struct Settings {
    pub model: String,
    pub temperature: f64,
    pub system_prompt: String,
    pub prefill: String,
    pub thinking_tokens: i64,
}

/// Mutable state common to all backends: settings, the global
/// conversation, counters, and the stream singleton.
pub struct ChatState {
    settings: RwLock<Settings>,
    conversation: RwLock<Vec<Message>>,
    last_tokens: AtomicU64,
    total_tokens: AtomicU64,
    /// Stream singleton; at most one producer at a time.
    pub stream: StreamState,
}

impl ChatState {
    /// New state with the given default model and thinking budget.
    pub fn new(model: &str, thinking_tokens: i64) -> Arc<Self> {
        Arc::new(Self {
            settings: RwLock::new(Settings {
                model: model.to_string(),
                temperature: 0.7,
                system_prompt: String::new(),
                prefill: String::new(),
                thinking_tokens,
            }),
            conversation: RwLock::new(Vec::new()),
            last_tokens: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            stream: StreamState::new(),
        })
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Snapshot of all settings, for building a request outside the lock.
    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn model(&self) -> String {
        self.settings.read().model.clone()
    }

    pub fn set_model(&self, model: &str) {
        self.settings.write().model = model.to_string();
    }

    pub fn temperature(&self) -> f64 {
        self.settings.read().temperature
    }

    /// Rejects values outside [0.0, 2.0]; the stored value is unchanged on
    /// rejection.
    pub fn set_temperature(&self, temp: f64) -> LlmResult<()> {
        if !(0.0..=2.0).contains(&temp) {
            return Err(LlmError::InvalidTemperature);
        }
        self.settings.write().temperature = temp;
        Ok(())
    }

    pub fn system_prompt(&self) -> String {
        self.settings.read().system_prompt.clone()
    }

    pub fn set_system_prompt(&self, prompt: &str) {
        self.settings.write().system_prompt = prompt.to_string();
    }

    pub fn prefill(&self) -> String {
        self.settings.read().prefill.clone()
    }

    pub fn set_prefill(&self, prefill: &str) {
        self.settings.write().prefill = prefill.to_string();
    }

    pub fn thinking_tokens(&self) -> i64 {
        self.settings.read().thinking_tokens
    }

    pub fn set_thinking_tokens(&self, tokens: i64) {
        self.settings.write().thinking_tokens = tokens;
    }

    // ========================================================================
    // Conversation
    // ========================================================================

    pub fn messages(&self) -> Vec<Message> {
        self.conversation.read().clone()
    }

    pub fn messages_json(&self) -> LlmResult<String> {
        let messages = self.conversation.read();
        serde_json::to_string_pretty(&*messages).map_err(|e| LlmError::Other(e.to_string()))
    }

    /// System messages are prepended so they stay ahead of the dialogue.
    pub fn add_system_message(&self, content: &str) {
        self.conversation.write().insert(0, Message::system(content));
    }

    pub fn push_user(&self, content: &str) {
        self.conversation.write().push(Message::user(content));
    }

    pub fn push_assistant(&self, content: &str) {
        self.conversation.write().push(Message::assistant(content));
    }

    /// Drop the most recent message; used to roll a failed request's user
    /// turn back out of the transcript.
    pub fn pop_last(&self) {
        self.conversation.write().pop();
    }

    pub fn reset(&self) {
        self.conversation.write().clear();
        self.last_tokens.store(0, Ordering::Relaxed);
        self.total_tokens.store(0, Ordering::Relaxed);
    }

    // ========================================================================
    // Token accounting
    // ========================================================================

    pub fn last_tokens(&self) -> u64 {
        self.last_tokens.load(Ordering::Relaxed)
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    /// Record a completed request's usage.
    pub fn record_usage(&self, tokens: u64) {
        self.last_tokens.store(tokens, Ordering::Relaxed);
        self.total_tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    // ========================================================================
    // Compaction
    // ========================================================================

    /// Replace the whole transcript with one synthetic summary message and
    /// reset the cumulative counter to the new transcript's size.
    pub fn replace_with_summary(&self, summary: &str, tokens: u64) {
        let message = format!("{SUMMARY_MESSAGE_PREFIX}{summary}");
        *self.conversation.write() = vec![Message::system(message)];
        self.total_tokens.store(tokens, Ordering::Relaxed);
    }

    /// Commit a finished stream: append the assistant turn and record the
    /// exchange's usage.
    pub fn commit_stream(&self, full_text: &str, tokens: u64) {
        self.push_assistant(full_text);
        self.record_usage(tokens);
    }
}

/// Render a transcript for the summarisation request, or `None` when there
/// are fewer than four non-system messages (nothing worth compacting).
pub fn transcript_for_summary(messages: &[Message]) -> Option<String> {
    let non_system: Vec<&Message> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();
    if non_system.len() < 4 {
        return None;
    }

    let mut transcript = String::new();
    for msg in non_system {
        transcript.push_str(msg.role.as_str());
        transcript.push_str(": ");
        transcript.push_str(&msg.content);
        transcript.push_str("\n\n");
    }
    Some(format!("{SUMMARY_PROMPT}{transcript}"))
}

/// Estimated size of the synthetic message a summary produces, for
/// backends whose transport does not report usage.
pub fn summary_tokens(summary: &str) -> u64 {
    limits::estimate_tokens(&format!("{SUMMARY_MESSAGE_PREFIX}{summary}"))
}

// ============================================================================
// Streaming
// ============================================================================

/// Handle given to a stream producer task.
pub struct StreamProducer {
    /// Chunk queue sender; dropping it ends the stream for readers.
    pub tx: mpsc::Sender<String>,
    /// Cancelled when the stream is torn down externally.
    pub cancel: CancellationToken,
}

/// The per-backend stream singleton.
///
/// At most one stream is active at a time: [`begin`](Self::begin) reserves
/// the slot or fails, the producer feeds the bounded queue, and
/// [`finish`](Self::finish) releases the slot and fires the completion
/// signal. Readers that arrive after the close drain the queue's remaining
/// end-of-stream state (`None`) forever.
pub struct StreamState {
    active: AtomicBool,
    rx: Mutex<Option<mpsc::Receiver<String>>>,
    done: watch::Sender<bool>,
    cancel: parking_lot::Mutex<CancellationToken>,
}

impl StreamState {
    fn new() -> Self {
        // No stream yet, so "done" starts true.
        let (done, _) = watch::channel(true);
        Self {
            active: AtomicBool::new(false),
            rx: Mutex::new(None),
            done,
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
        }
    }

    /// Reserve the stream slot and hand the producer its queue.
    ///
    /// Fails with [`LlmError::StreamActive`] if a stream is running.
    pub async fn begin(&self) -> LlmResult<StreamProducer> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LlmError::StreamActive);
        }

        let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        *self.rx.lock().await = Some(rx);
        self.done.send_replace(false);

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        Ok(StreamProducer { tx, cancel })
    }

    /// Release the slot and signal completion. Called by the producer when
    /// the source ends, fails, or is cancelled.
    pub fn finish(&self) {
        self.active.store(false, Ordering::Release);
        self.done.send_replace(true);
    }

    /// Dequeue the next chunk, blocking until one arrives. `None` once the
    /// producer has dropped its sender and the queue is drained.
    pub async fn next_chunk(&self) -> Option<String> {
        let mut guard = self.rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Whether a producer currently holds the slot.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until the current stream (if any) completes.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Cancel the running producer, if any. Pending chunks are dropped
    /// with the queue; text already delivered is not rolled back.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }
}
