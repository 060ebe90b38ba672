//! The `ask` file: the main interaction point.
//!
//! A write is a complete prompt dispatched against the writing fid's own
//! session; a read returns that session's last response. Backend failures
//! do not fail the write — shell clients cannot inspect an error code
//! from `echo >`, so the error text becomes the readable response
//! instead, prefixed `Error: `.

use std::sync::Arc;

use async_trait::async_trait;
use delphi_llm::{SessionManager, AUTO_COMPACT_THRESHOLD};
use tracing::warn;

use crate::fs::{read_slice, terminated, write_text, FidAwareNode, FsResult, Node, NodeMeta};

/// Per-session prompt/response file.
pub struct AskFile {
    meta: NodeMeta,
    sessions: Arc<SessionManager>,
}

impl AskFile {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            meta: NodeMeta::new("ask", 0o666),
            sessions,
        }
    }
}

#[async_trait]
impl Node for AskFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    fn as_fid_aware(&self) -> Option<&dyn FidAwareNode> {
        Some(self)
    }
}

#[async_trait]
impl FidAwareNode for AskFile {
    async fn read_fid(&self, fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let Some(session) = self.sessions.get(fid) else {
            return Ok(Vec::new());
        };
        let content = terminated(&session.last_response());
        Ok(read_slice(content.as_bytes(), offset, count))
    }

    async fn write_fid(&self, fid: u32, data: &[u8], _offset: u64) -> FsResult<u32> {
        let accepted = data.len() as u32;
        let prompt = write_text(data);
        if prompt.is_empty() {
            return Ok(accepted);
        }

        // Sessions are not auto-compacted; flag the pressure and leave the
        // reset to the client (a write to `new`).
        let session = self.sessions.get_or_create(fid);
        let limit = self.sessions.context_limit().await;
        let threshold = (limit as f64 * AUTO_COMPACT_THRESHOLD) as u64;
        if session.total_tokens() > threshold {
            warn!(
                fid,
                tokens = session.total_tokens(),
                limit,
                "session is near the context limit; write to `new` to reset"
            );
        }

        // Errors land in the session's last response; the write succeeds.
        let _ = self.sessions.ask(fid, &prompt).await;
        self.meta.touch();
        Ok(accepted)
    }

    fn close_fid(&self, fid: u32) {
        self.sessions.remove(fid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delphi_llm::testing::MockBackend;

    fn ask_file() -> (Arc<MockBackend>, AskFile) {
        let backend = MockBackend::shared();
        let sessions = SessionManager::new(backend.clone());
        (backend, AskFile::new(sessions))
    }

    #[tokio::test]
    async fn test_read_before_any_write_is_eof() {
        let (_, ask) = ask_file();
        let data = ask.read_fid(1, 0, 100).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (backend, ask) = ask_file();
        backend.set_ask_response("Hi there");

        let n = ask.write_fid(2, b"Hello!", 0).await.unwrap();
        assert_eq!(n, 6);

        let data = ask.read_fid(2, 0, 100).await.unwrap();
        assert_eq!(data, b"Hi there\n");

        // Reading past the end is end-of-stream.
        let rest = ask.read_fid(2, data.len() as u64, 100).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_empty_write_is_noop() {
        let (_, ask) = ask_file();
        assert_eq!(ask.write_fid(1, b"", 0).await.unwrap(), 0);
        assert_eq!(ask.write_fid(1, b"   \n\t  ", 0).await.unwrap(), 7);
        assert!(ask.read_fid(1, 0, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_is_readable_not_fatal() {
        let (backend, ask) = ask_file();
        backend.set_ask_error("boom");

        // The write reports full acceptance.
        let n = ask.write_fid(1, b"test", 0).await.unwrap();
        assert_eq!(n, 4);

        let data = ask.read_fid(1, 0, 200).await.unwrap();
        let text = String::from_utf8(data).unwrap();
        assert!(text.starts_with("Error:"), "got {text:?}");
        assert!(text.contains("boom"));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated_per_fid() {
        let (backend, ask) = ask_file();

        backend.set_ask_response("ra");
        ask.write_fid(3, b"A", 0).await.unwrap();

        backend.set_ask_response("rb");
        ask.write_fid(4, b"B", 0).await.unwrap();

        assert_eq!(ask.read_fid(3, 0, 100).await.unwrap(), b"ra\n");
        assert_eq!(ask.read_fid(4, 0, 100).await.unwrap(), b"rb\n");
    }

    #[tokio::test]
    async fn test_close_fid_drops_session() {
        let (backend, ask) = ask_file();
        backend.set_ask_response("r");
        ask.write_fid(1, b"q", 0).await.unwrap();

        ask.close_fid(1);
        assert!(ask.read_fid(1, 0, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_response_newline_not_doubled() {
        let (backend, ask) = ask_file();

        backend.set_ask_response("no newline");
        ask.write_fid(1, b"q", 0).await.unwrap();
        assert_eq!(ask.read_fid(1, 0, 100).await.unwrap(), b"no newline\n");

        backend.set_ask_response("has newline\n");
        ask.write_fid(2, b"q", 0).await.unwrap();
        assert_eq!(ask.read_fid(2, 0, 100).await.unwrap(), b"has newline\n");
    }

    #[tokio::test]
    async fn test_stat_has_no_per_fid_length() {
        let (backend, ask) = ask_file();
        backend.set_ask_response("Hello!");
        ask.write_fid(1, b"q", 0).await.unwrap();

        // Length is per-fid state; stat has no fid.
        assert_eq!(ask.stat().await.length, 0);
    }
}
