//! The `compact` file: manual compaction trigger.
//!
//! Any non-empty write collapses the backend's transcript into a single
//! summary message. The write itself always succeeds; the outcome is
//! readable afterwards as `ready`, `ok: <total>/<limit>`, or
//! `error: <message>`.

use std::sync::Arc;

use async_trait::async_trait;
use delphi_llm::Backend;
use parking_lot::RwLock;

use crate::fs::{read_slice, write_text, FsResult, Node, NodeMeta};

/// Compaction trigger and status report.
pub struct CompactFile {
    meta: NodeMeta,
    backend: Arc<dyn Backend>,
    last_result: RwLock<String>,
}

impl CompactFile {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            meta: NodeMeta::new("compact", 0o666),
            backend,
            last_result: RwLock::new("ready\n".to_string()),
        }
    }
}

#[async_trait]
impl Node for CompactFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    async fn length(&self) -> u64 {
        self.last_result.read().len() as u64
    }

    async fn read(&self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let content = self.last_result.read().clone();
        Ok(read_slice(content.as_bytes(), offset, count))
    }

    async fn write(&self, data: &[u8], _offset: u64) -> FsResult<u32> {
        let accepted = data.len() as u32;
        if write_text(data).is_empty() {
            return Ok(accepted);
        }

        let status = match self.backend.compact().await {
            Ok(()) => {
                let total = self.backend.total_tokens();
                let limit = self.backend.context_limit().await;
                format!("ok: {total}/{limit}\n")
            }
            Err(e) => format!("error: {e}\n"),
        };

        *self.last_result.write() = status;
        self.meta.touch();
        Ok(accepted)
    }
}
