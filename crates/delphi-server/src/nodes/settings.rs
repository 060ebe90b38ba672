//! Settings files: `model`, `temperature`, `system`, `thinking`,
//! `prefill`. Each is a small read/write view over one backend scalar;
//! writes treat the payload as a complete value and ignore the offset.

use std::sync::Arc;

use async_trait::async_trait;
use delphi_llm::{Backend, LlmError};

use crate::fs::{read_slice, terminated, write_text, FsError, FsResult, Node, NodeMeta};

/// Current model identifier.
pub struct ModelFile {
    meta: NodeMeta,
    backend: Arc<dyn Backend>,
}

impl ModelFile {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            meta: NodeMeta::new("model", 0o666),
            backend,
        }
    }

    fn content(&self) -> String {
        terminated(&self.backend.model())
    }
}

#[async_trait]
impl Node for ModelFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    async fn length(&self) -> u64 {
        self.content().len() as u64
    }

    async fn read(&self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        Ok(read_slice(self.content().as_bytes(), offset, count))
    }

    async fn write(&self, data: &[u8], _offset: u64) -> FsResult<u32> {
        let model = write_text(data);
        if model.is_empty() {
            return Err(FsError::Llm(LlmError::EmptyModel));
        }
        self.backend.set_model(&model);
        self.meta.touch();
        Ok(data.len() as u32)
    }
}

/// Sampling temperature, rendered with two decimals.
pub struct TemperatureFile {
    meta: NodeMeta,
    backend: Arc<dyn Backend>,
}

impl TemperatureFile {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            meta: NodeMeta::new("temperature", 0o666),
            backend,
        }
    }

    fn content(&self) -> String {
        format!("{:.2}\n", self.backend.temperature())
    }
}

#[async_trait]
impl Node for TemperatureFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    async fn length(&self) -> u64 {
        self.content().len() as u64
    }

    async fn read(&self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        Ok(read_slice(self.content().as_bytes(), offset, count))
    }

    async fn write(&self, data: &[u8], _offset: u64) -> FsResult<u32> {
        let text = write_text(data);
        let temp: f64 = text
            .parse()
            .map_err(|e| FsError::Other(format!("invalid temperature: {e}")))?;
        self.backend.set_temperature(temp)?;
        self.meta.touch();
        Ok(data.len() as u32)
    }
}

/// Process-wide system prompt. Writing an empty value clears it.
pub struct SystemFile {
    meta: NodeMeta,
    backend: Arc<dyn Backend>,
}

impl SystemFile {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            meta: NodeMeta::new("system", 0o666),
            backend,
        }
    }

    fn content(&self) -> String {
        terminated(&self.backend.system_prompt())
    }
}

#[async_trait]
impl Node for SystemFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    async fn length(&self) -> u64 {
        self.content().len() as u64
    }

    async fn read(&self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        Ok(read_slice(self.content().as_bytes(), offset, count))
    }

    async fn write(&self, data: &[u8], _offset: u64) -> FsResult<u32> {
        self.backend.set_system_prompt(&write_text(data));
        self.meta.touch();
        Ok(data.len() as u32)
    }
}

/// Thinking token budget. Reads render −1 as `max` and 0 as `off`;
/// writes accept those words, a handful of synonyms, or a number.
pub struct ThinkingFile {
    meta: NodeMeta,
    backend: Arc<dyn Backend>,
}

impl ThinkingFile {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            meta: NodeMeta::new("thinking", 0o666),
            backend,
        }
    }

    fn content(&self) -> String {
        match self.backend.thinking_tokens() {
            t if t < 0 => "max\n".to_string(),
            0 => "off\n".to_string(),
            t => format!("{t}\n"),
        }
    }
}

/// Parse a thinking budget value; negatives clamp to −1.
fn parse_thinking(input: &str) -> FsResult<i64> {
    match input.to_lowercase().as_str() {
        "max" | "on" | "true" | "enabled" | "-1" => Ok(-1),
        "off" | "false" | "disabled" | "0" => Ok(0),
        other => {
            let tokens: i64 = other.parse().map_err(|_| {
                FsError::Other("invalid thinking value: use 'max', 'off', or a number".into())
            })?;
            Ok(if tokens < 0 { -1 } else { tokens })
        }
    }
}

#[async_trait]
impl Node for ThinkingFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    async fn length(&self) -> u64 {
        self.content().len() as u64
    }

    async fn read(&self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        Ok(read_slice(self.content().as_bytes(), offset, count))
    }

    async fn write(&self, data: &[u8], _offset: u64) -> FsResult<u32> {
        let tokens = parse_thinking(&write_text(data))?;
        self.backend.set_thinking_tokens(tokens);
        self.meta.touch();
        Ok(data.len() as u32)
    }
}

/// Assistant-response prefill, e.g. a character tag the model should
/// stay behind. Empty when unset.
pub struct PrefillFile {
    meta: NodeMeta,
    backend: Arc<dyn Backend>,
}

impl PrefillFile {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            meta: NodeMeta::new("prefill", 0o666),
            backend,
        }
    }

    fn content(&self) -> String {
        terminated(&self.backend.prefill())
    }
}

#[async_trait]
impl Node for PrefillFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    async fn length(&self) -> u64 {
        self.content().len() as u64
    }

    async fn read(&self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        Ok(read_slice(self.content().as_bytes(), offset, count))
    }

    async fn write(&self, data: &[u8], _offset: u64) -> FsResult<u32> {
        self.backend.set_prefill(&write_text(data));
        self.meta.touch();
        Ok(data.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delphi_llm::testing::MockBackend;

    #[tokio::test]
    async fn test_model_read_write() {
        let backend = MockBackend::shared();
        let file = ModelFile::new(backend.clone());

        assert_eq!(file.read(0, 100).await.unwrap(), b"mock-model\n");
        assert_eq!(file.length().await, 11);

        file.write(b"claude-3-haiku-20240307\n", 0).await.unwrap();
        assert_eq!(backend.model(), "claude-3-haiku-20240307");
    }

    #[tokio::test]
    async fn test_model_rejects_empty() {
        let backend = MockBackend::shared();
        let file = ModelFile::new(backend);
        let err = file.write(b"  \n", 0).await.unwrap_err();
        assert_eq!(err.to_string(), "model name cannot be empty");
    }

    #[tokio::test]
    async fn test_temperature_read_write() {
        let backend = MockBackend::shared();
        let file = TemperatureFile::new(backend.clone());

        assert_eq!(file.read(0, 100).await.unwrap(), b"0.70\n");

        file.write(b"0.5\n", 0).await.unwrap();
        assert_eq!(backend.temperature(), 0.5);
        assert_eq!(file.read(0, 100).await.unwrap(), b"0.50\n");
    }

    #[tokio::test]
    async fn test_temperature_rejects_bad_values() {
        let backend = MockBackend::shared();
        let file = TemperatureFile::new(backend.clone());

        let err = file.write(b"hot", 0).await.unwrap_err();
        assert!(err.to_string().starts_with("invalid temperature"));

        let err = file.write(b"3.0", 0).await.unwrap_err();
        assert_eq!(err.to_string(), "temperature must be between 0.0 and 2.0");
        // Stored value survives the rejection.
        assert_eq!(backend.temperature(), 0.7);
    }

    #[tokio::test]
    async fn test_system_prompt_round_trip() {
        let backend = MockBackend::shared();
        let file = SystemFile::new(backend.clone());

        assert!(file.read(0, 100).await.unwrap().is_empty());
        assert_eq!(file.length().await, 0);

        file.write(b"Be brief.\n", 0).await.unwrap();
        assert_eq!(backend.system_prompt(), "Be brief.");
        assert_eq!(file.read(0, 100).await.unwrap(), b"Be brief.\n");

        // Empty write clears.
        file.write(b"\n", 0).await.unwrap();
        assert_eq!(backend.system_prompt(), "");
    }

    #[tokio::test]
    async fn test_thinking_rendering() {
        let backend = MockBackend::shared();
        let file = ThinkingFile::new(backend.clone());

        assert_eq!(file.read(0, 100).await.unwrap(), b"off\n");

        file.write(b"max", 0).await.unwrap();
        assert_eq!(backend.thinking_tokens(), -1);
        assert_eq!(file.read(0, 100).await.unwrap(), b"max\n");

        file.write(b"4096", 0).await.unwrap();
        assert_eq!(file.read(0, 100).await.unwrap(), b"4096\n");

        file.write(b"off", 0).await.unwrap();
        assert_eq!(backend.thinking_tokens(), 0);
    }

    #[test]
    fn test_parse_thinking_synonyms() {
        for word in ["max", "on", "true", "enabled", "-1", "MAX"] {
            assert_eq!(parse_thinking(word).unwrap(), -1, "{word}");
        }
        for word in ["off", "false", "disabled", "0"] {
            assert_eq!(parse_thinking(word).unwrap(), 0, "{word}");
        }
        assert_eq!(parse_thinking("1024").unwrap(), 1024);
        assert_eq!(parse_thinking("-50").unwrap(), -1);
        assert!(parse_thinking("lots").is_err());
    }

    #[tokio::test]
    async fn test_prefill_round_trip() {
        let backend = MockBackend::shared();
        let file = PrefillFile::new(backend.clone());

        assert!(file.read(0, 100).await.unwrap().is_empty());

        file.write(b"[Veltro] ", 0).await.unwrap();
        assert_eq!(backend.prefill(), "[Veltro]");
        assert_eq!(file.read(0, 100).await.unwrap(), b"[Veltro]\n");
    }
}
