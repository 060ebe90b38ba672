//! Claude CLI subprocess backend.
//!
//! Drives the `claude` binary in non-interactive mode so a Max
//! subscription can serve requests without API credit. Conversation
//! history is flattened to `Human:` / `Assistant:` turns on stdin; the
//! system prompt travels via `--system-prompt`. Blocking asks parse the
//! CLI's JSON output; streaming switches to text output and forwards
//! stdout in small reads. Token counts are estimated because the CLI
//! reports none.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::chat::{transcript_for_summary, summary_tokens, ChatState};
use crate::limits::{cloud_context_limit, estimate_tokens, normalize_cli_model};
use crate::{auto_compact_if_needed, Backend, LlmError, LlmResult, Message, Role};

const CLI_BINARY: &str = "claude";
/// Budget exported when thinking is set to maximum.
const MAX_THINKING_BUDGET: i64 = 31_999;
/// Small reads keep streamed output responsive.
const STREAM_READ_SIZE: usize = 256;

/// Backend that shells out to the Claude Code CLI.
pub struct CliBackend {
    chat: Arc<ChatState>,
}

impl CliBackend {
    /// New CLI backend; thinking defaults to maximum.
    pub fn new() -> Self {
        Self {
            // The CLI takes short model aliases.
            chat: ChatState::new("sonnet", -1),
        }
    }

    /// Flatten history (plus an optional trailing prompt) into the
    /// Human/Assistant transcript the CLI expects on stdin.
    fn build_prompt(history: &[Message], prompt: Option<&str>) -> String {
        let mut parts = Vec::new();
        for msg in history {
            match msg.role {
                Role::User => parts.push(format!("Human: {}", msg.content)),
                Role::Assistant => parts.push(format!("Assistant: {}", msg.content)),
                Role::System => {}
            }
        }
        if let Some(prompt) = prompt {
            parts.push(format!("Human: {prompt}"));
        }
        parts.join("\n\n")
    }

    /// Join the dedicated system prompt with system-role history messages.
    fn build_system_prompt(dedicated: &str, history: &[Message]) -> String {
        let mut parts = Vec::new();
        if !dedicated.is_empty() {
            parts.push(dedicated.to_string());
        }
        for msg in history {
            if msg.role == Role::System {
                parts.push(msg.content.clone());
            }
        }
        parts.join("\n\n")
    }

    /// Common CLI argv. `json` selects structured output for blocking
    /// calls; streaming uses raw text.
    ///
    /// Tools are disabled and the permission prompt skipped: the CLI would
    /// otherwise block on interactive dialogs even for text-only use.
    fn build_args(model: &str, system_prompt: &str, json: bool) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            if json { "json" } else { "text" }.to_string(),
            "--model".to_string(),
            model.to_string(),
            "--allowedTools".to_string(),
            String::new(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if !system_prompt.is_empty() {
            args.push("--system-prompt".to_string());
            args.push(system_prompt.to_string());
        }
        args.push("-".to_string());
        args
    }

    fn thinking_env(tokens: i64) -> String {
        if tokens < 0 {
            MAX_THINKING_BUDGET.to_string()
        } else {
            tokens.to_string()
        }
    }

    /// Run the CLI to completion, feeding `input` on stdin.
    async fn run(args: &[String], thinking_tokens: i64, input: &str) -> LlmResult<String> {
        let mut child = Command::new(CLI_BINARY)
            .args(args)
            .env("MAX_THINKING_TOKENS", Self::thinking_env(thinking_tokens))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LlmError::Cli(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| LlmError::Cli(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| LlmError::Cli(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LlmError::Cli(format!(
                "{} (stderr: {})",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Extract the result from the CLI's JSON output.
    ///
    /// The CLI may emit several JSON objects, one per line; the one with
    /// `type == "result"` carries the response. Falls back to raw output
    /// when no structured result is present.
    fn parse_json_response(output: &str) -> LlmResult<String> {
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(line) {
                if value["type"] == "result" {
                    if let Some(result) = value["result"].as_str() {
                        if !result.is_empty() {
                            return Ok(result.to_string());
                        }
                    }
                }
            }
        }

        let trimmed = output.trim();
        if trimmed.is_empty() {
            Err(LlmError::Cli("no result in CLI output".into()))
        } else {
            Ok(trimmed.to_string())
        }
    }
}

impl Default for CliBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for CliBackend {
    fn model(&self) -> String {
        self.chat.model()
    }

    fn set_model(&self, model: &str) {
        self.chat.set_model(normalize_cli_model(model));
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
        cloud_context_limit(&self.chat.model())
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
        let history = self.chat.messages();
        let full_prompt = Self::build_prompt(&history, None);
        let system_prompt = Self::build_system_prompt(&settings.system_prompt, &history);
        let args = Self::build_args(&settings.model, &system_prompt, true);

        let result = Self::run(&args, settings.thinking_tokens, &full_prompt)
            .await
            .and_then(|out| Self::parse_json_response(&out));

        match result {
            Ok(text) => {
                self.chat.push_assistant(&text);
                self.chat
                    .record_usage(estimate_tokens(&full_prompt) + estimate_tokens(&text));
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
        let full_prompt = Self::build_prompt(history, Some(prompt));
        let system_prompt = Self::build_system_prompt(&settings.system_prompt, history);
        let args = Self::build_args(&settings.model, &system_prompt, true);

        let output = Self::run(&args, settings.thinking_tokens, &full_prompt).await?;
        let text = Self::parse_json_response(&output)?;

        // The CLI has no partial-assistant prefill; prepend post hoc so
        // behaviour matches the API backends.
        let text = if settings.prefill.is_empty() {
            text
        } else {
            format!("{}{}", settings.prefill, text)
        };

        let tokens = estimate_tokens(&full_prompt) + estimate_tokens(&text);
        Ok((text, tokens))
    }

    async fn compact(&self) -> LlmResult<()> {
        let Some(summary_prompt) = transcript_for_summary(&self.chat.messages()) else {
            return Ok(());
        };

        let settings = self.chat.settings();
        let args = Self::build_args(&settings.model, "", true);
        let output = Self::run(&args, settings.thinking_tokens, &summary_prompt)
            .await
            .map_err(|e| LlmError::Cli(format!("compaction failed: {e}")))?;
        let summary = Self::parse_json_response(&output)
            .map_err(|e| LlmError::Cli(format!("compaction parse failed: {e}")))?;

        self.chat
            .replace_with_summary(&summary, summary_tokens(&summary));
        Ok(())
    }

    async fn start_stream(&self, prompt: &str) -> LlmResult<()> {
        let producer = self.chat.stream.begin().await?;

        self.chat.push_user(prompt);
        let settings = self.chat.settings();
        let history = self.chat.messages();
        let full_prompt = Self::build_prompt(&history, None);
        let system_prompt = Self::build_system_prompt(&settings.system_prompt, &history);
        let args = Self::build_args(&settings.model, &system_prompt, false);
        let thinking = settings.thinking_tokens;

        let chat = self.chat.clone();
        tokio::spawn(async move {
            let mut full = String::new();
            let mut failure: Option<String> = None;

            let spawned = Command::new(CLI_BINARY)
                .args(&args)
                .env("MAX_THINKING_TOKENS", Self::thinking_env(thinking))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn();

            match spawned {
                Ok(mut child) => {
                    if let Some(mut stdin) = child.stdin.take() {
                        let _ = stdin.write_all(full_prompt.as_bytes()).await;
                        drop(stdin);
                    }

                    if let Some(mut stdout) = child.stdout.take() {
                        let mut buf = [0u8; STREAM_READ_SIZE];
                        loop {
                            let read = tokio::select! {
                                _ = producer.cancel.cancelled() => {
                                    let _ = child.kill().await;
                                    break;
                                }
                                read = stdout.read(&mut buf) => read,
                            };
                            match read {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                                    full.push_str(&chunk);
                                    let sent = tokio::select! {
                                        _ = producer.cancel.cancelled() => false,
                                        result = producer.tx.send(chunk) => result.is_ok(),
                                    };
                                    if !sent {
                                        let _ = child.kill().await;
                                        break;
                                    }
                                }
                            }
                        }
                    }

                    match child.wait().await {
                        Ok(status) if !status.success() && full.is_empty() => {
                            failure = Some(status.to_string());
                        }
                        Err(e) if full.is_empty() => failure = Some(e.to_string()),
                        _ => {}
                    }
                }
                Err(e) => failure = Some(e.to_string()),
            }

            if full.is_empty() {
                if let Some(msg) = failure {
                    let _ = producer.tx.send(format!("[Error: {msg}]")).await;
                }
                chat.pop_last();
            } else {
                let tokens = estimate_tokens(&full_prompt) + estimate_tokens(&full);
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
