//! Streaming files: `stream/ask` and `stream/chunk`.
//!
//! Writing a prompt to `stream/ask` spawns the backend's producer task;
//! reads on `stream/chunk` then block until the next chunk arrives.
//! End-of-stream is a zero-byte read, after which `chunk` keeps
//! returning end-of-stream until a new stream starts.

use std::sync::Arc;

use async_trait::async_trait;
use delphi_llm::Backend;

use crate::fs::{write_text, FsError, FsResult, Node, NodeMeta};

/// Write-only trigger that starts a streaming request.
pub struct StreamAskFile {
    meta: NodeMeta,
    backend: Arc<dyn Backend>,
}

impl StreamAskFile {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            meta: NodeMeta::new("ask", 0o222),
            backend,
        }
    }
}

#[async_trait]
impl Node for StreamAskFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    async fn read(&self, _offset: u64, _count: u32) -> FsResult<Vec<u8>> {
        Err(FsError::PermissionDenied)
    }

    async fn write(&self, data: &[u8], _offset: u64) -> FsResult<u32> {
        let prompt = write_text(data);
        if prompt.is_empty() {
            return Ok(data.len() as u32);
        }

        // Unlike `ask`, a failure to start is a real write error: the
        // client needs to know no stream exists to read from.
        self.backend.start_stream(&prompt).await?;
        Ok(data.len() as u32)
    }
}

/// Blocking reader over the active stream's chunk queue.
pub struct ChunkFile {
    meta: NodeMeta,
    backend: Arc<dyn Backend>,
}

impl ChunkFile {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            meta: NodeMeta::new("chunk", 0o444),
            backend,
        }
    }
}

#[async_trait]
impl Node for ChunkFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    async fn read(&self, _offset: u64, count: u32) -> FsResult<Vec<u8>> {
        if !self.backend.is_streaming() {
            return Ok(Vec::new());
        }

        match self.backend.read_stream_chunk().await {
            Some(chunk) => {
                let mut bytes = chunk.into_bytes();
                bytes.truncate(count as usize);
                Ok(bytes)
            }
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delphi_llm::testing::MockBackend;

    #[tokio::test]
    async fn test_chunk_eof_without_stream() {
        let chunk = ChunkFile::new(MockBackend::shared());
        assert!(chunk.read(0, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let backend = MockBackend::shared();
        backend.set_stream_chunks(&["Once ", "upon ", "a time"]);

        let ask = StreamAskFile::new(backend.clone());
        let chunk = ChunkFile::new(backend.clone());

        let n = ask.write(b"tell me a story", 0).await.unwrap();
        assert_eq!(n, 15);

        let mut out = String::new();
        loop {
            let data = chunk.read(0, 4096).await.unwrap();
            if data.is_empty() {
                break;
            }
            out.push_str(&String::from_utf8(data).unwrap());
        }
        assert_eq!(out, "Once upon a time");

        backend.wait_stream().await;
        assert!(!backend.is_streaming());
        // End-of-stream is sticky after completion.
        assert!(chunk.read(0, 4096).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_stream_while_active_fails() {
        let backend = MockBackend::shared();
        // More chunks than the queue holds, so the producer cannot finish
        // until a reader drains it and the slot stays held.
        let chunks: Vec<String> = (0..150).map(|i| format!("c{i} ")).collect();
        let refs: Vec<&str> = chunks.iter().map(|s| s.as_str()).collect();
        backend.set_stream_chunks(&refs);
        let ask = StreamAskFile::new(backend.clone());

        ask.write(b"one", 0).await.unwrap();
        let err = ask.write(b"two", 0).await.unwrap_err();
        assert_eq!(err.to_string(), "stream already in progress");

        // Drain so the producer can finish.
        let chunk = ChunkFile::new(backend.clone());
        while !chunk.read(0, 4096).await.unwrap().is_empty() {}
        backend.wait_stream().await;

        // A fresh stream is allowed afterwards.
        ask.write(b"three", 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_error_surfaces_as_marker_chunk() {
        let backend = MockBackend::shared();
        backend.set_stream_error("connection refused");
        let ask = StreamAskFile::new(backend.clone());
        let chunk = ChunkFile::new(backend.clone());

        ask.write(b"go", 0).await.unwrap();

        let data = chunk.read(0, 4096).await.unwrap();
        assert_eq!(data, b"[Error: connection refused]");
        backend.wait_stream().await;
    }

    #[tokio::test]
    async fn test_empty_stream_write_is_noop() {
        let backend = MockBackend::shared();
        let ask = StreamAskFile::new(backend.clone());
        ask.write(b"\n", 0).await.unwrap();
        assert!(!backend.is_streaming());
    }

    #[tokio::test]
    async fn test_chunk_respects_count() {
        let backend = MockBackend::shared();
        backend.set_stream_chunks(&["abcdef"]);
        let ask = StreamAskFile::new(backend.clone());
        let chunk = ChunkFile::new(backend.clone());

        ask.write(b"go", 0).await.unwrap();
        let data = chunk.read(0, 3).await.unwrap();
        assert_eq!(data, b"abc");
        backend.wait_stream().await;
    }
}
