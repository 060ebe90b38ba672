//! Session lifecycle files: `new` and `context`.

use std::sync::Arc;

use async_trait::async_trait;
use delphi_llm::SessionManager;

use crate::fs::{read_slice, write_text, FidAwareNode, FsError, FsResult, Node, NodeMeta};

/// Write-only reset switch: any write clears the writing fid's session.
pub struct NewFile {
    meta: NodeMeta,
    sessions: Arc<SessionManager>,
}

impl NewFile {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            meta: NodeMeta::new("new", 0o222),
            sessions,
        }
    }
}

#[async_trait]
impl Node for NewFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    fn as_fid_aware(&self) -> Option<&dyn FidAwareNode> {
        Some(self)
    }
}

#[async_trait]
impl FidAwareNode for NewFile {
    async fn read_fid(&self, _fid: u32, _offset: u64, _count: u32) -> FsResult<Vec<u8>> {
        Err(FsError::PermissionDenied)
    }

    async fn write_fid(&self, fid: u32, data: &[u8], _offset: u64) -> FsResult<u32> {
        self.sessions.reset(fid);
        Ok(data.len() as u32)
    }

    fn close_fid(&self, fid: u32) {
        self.sessions.remove(fid);
    }
}

/// Conversation history window.
///
/// Reads return the fid's history as JSON; writes prepend a system
/// message to that history.
pub struct ContextFile {
    meta: NodeMeta,
    sessions: Arc<SessionManager>,
}

impl ContextFile {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            meta: NodeMeta::new("context", 0o666),
            sessions,
        }
    }
}

#[async_trait]
impl Node for ContextFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    fn as_fid_aware(&self) -> Option<&dyn FidAwareNode> {
        Some(self)
    }
}

#[async_trait]
impl FidAwareNode for ContextFile {
    async fn read_fid(&self, fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let session = self.sessions.get_or_create(fid);
        let json = session
            .messages_json()
            .map_err(|e| FsError::Other(e.to_string()))?;
        let content = format!("{json}\n");
        Ok(read_slice(content.as_bytes(), offset, count))
    }

    async fn write_fid(&self, fid: u32, data: &[u8], _offset: u64) -> FsResult<u32> {
        let message = write_text(data);
        if !message.is_empty() {
            self.sessions.get_or_create(fid).add_system_message(&message);
            self.meta.touch();
        }
        Ok(data.len() as u32)
    }

    fn close_fid(&self, fid: u32) {
        self.sessions.remove(fid);
    }
}
