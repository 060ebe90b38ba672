//! Read-only observability files: `tokens` and `usage`.

use std::sync::Arc;

use async_trait::async_trait;
use delphi_llm::Backend;

use crate::fs::{read_slice, FsError, FsResult, Node, NodeMeta};

/// Token count of the last completed request.
pub struct TokensFile {
    meta: NodeMeta,
    backend: Arc<dyn Backend>,
}

impl TokensFile {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            meta: NodeMeta::new("tokens", 0o444),
            backend,
        }
    }

    fn content(&self) -> String {
        format!("{}\n", self.backend.last_tokens())
    }
}

#[async_trait]
impl Node for TokensFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    async fn length(&self) -> u64 {
        self.content().len() as u64
    }

    async fn read(&self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        Ok(read_slice(self.content().as_bytes(), offset, count))
    }
}

/// Cumulative usage against the model's context window:
/// `<total>/<limit>`.
pub struct UsageFile {
    meta: NodeMeta,
    backend: Arc<dyn Backend>,
}

impl UsageFile {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            meta: NodeMeta::new("usage", 0o444),
            backend,
        }
    }

    async fn content(&self) -> String {
        format!(
            "{}/{}\n",
            self.backend.total_tokens(),
            self.backend.context_limit().await
        )
    }
}

#[async_trait]
impl Node for UsageFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    async fn length(&self) -> u64 {
        self.content().await.len() as u64
    }

    async fn read(&self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        Ok(read_slice(self.content().await.as_bytes(), offset, count))
    }

    async fn write(&self, _data: &[u8], _offset: u64) -> FsResult<u32> {
        Err(FsError::Other("usage is read-only".into()))
    }
}
