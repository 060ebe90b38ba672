//! Node abstraction for the virtual file tree.
//!
//! Everything exposed over 9P satisfies [`Node`]. Directories additionally
//! implement [`DirNode`]; files whose behaviour depends on which client
//! handle is talking implement [`FidAwareNode`]. The dispatcher discovers
//! the extensions through the `as_dir` / `as_fid_aware` accessors, so a
//! node opts in simply by returning `Some(self)`.
//!
//! Reads return the requested byte range; an empty result is
//! end-of-stream, which the dispatcher translates to a zero-byte Rread.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use delphi_llm::LlmError;
use delphi_proto::{file_mode, qid_type, Qid, Stat};
use parking_lot::RwLock;
use thiserror::Error;

/// Owner and group label for every node in the tree.
pub const FS_OWNER: &str = "llm";

/// Node-level errors; the `Display` strings are the Rerror payloads.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("file not found")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("permission denied")]
    PermissionDenied,

    #[error("bad fid")]
    BadFid,

    #[error("fid already in use")]
    FidInUse,

    #[error("bad offset")]
    BadOffset,

    /// Backend failure surfaced through a node operation.
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("{0}")]
    Other(String),
}

/// Result alias for node operations.
pub type FsResult<T> = Result<T, FsError>;

static NEXT_PATH: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique qid path.
pub fn next_path() -> u64 {
    NEXT_PATH.fetch_add(1, Ordering::Relaxed)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Identity and metadata shared by every node implementation.
///
/// The qid version and mtime live behind atomics so content mutators can
/// advance them through a shared reference.
pub struct NodeMeta {
    name: String,
    mode: u32,
    qid_path: u64,
    qid_type: u8,
    version: AtomicU32,
    mtime: AtomicU64,
}

impl NodeMeta {
    /// New metadata; the qid type is derived from the directory bit.
    pub fn new(name: &str, mode: u32) -> Self {
        let qtype = if mode & file_mode::DMDIR != 0 {
            qid_type::DIR
        } else {
            qid_type::FILE
        };
        Self {
            name: name.to_string(),
            mode,
            qid_path: next_path(),
            qid_type: qtype,
            version: AtomicU32::new(0),
            mtime: AtomicU64::new(unix_now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qid(&self) -> Qid {
        Qid {
            qtype: self.qid_type,
            version: self.version.load(Ordering::Relaxed),
            path: self.qid_path,
        }
    }

    /// Record a content mutation: bump the qid version, refresh mtime.
    pub fn touch(&self) {
        self.version.fetch_add(1, Ordering::Relaxed);
        self.mtime.store(unix_now(), Ordering::Relaxed);
    }

    /// Stat view with the given content length.
    pub fn stat(&self, length: u64) -> Stat {
        let mtime = self.mtime.load(Ordering::Relaxed) as u32;
        Stat {
            srv_type: 0,
            dev: 0,
            qid: self.qid(),
            mode: self.mode,
            atime: mtime,
            mtime,
            length,
            name: self.name.clone(),
            uid: FS_OWNER.into(),
            gid: FS_OWNER.into(),
            muid: FS_OWNER.into(),
        }
    }
}

/// Common contract for every entry in the tree.
///
/// The base implementations are permissive defaults: open accepts any
/// mode, read is end-of-stream everywhere, write is permission-denied,
/// close is a no-op.
#[async_trait]
pub trait Node: Send + Sync {
    /// The node's identity and metadata.
    fn meta(&self) -> &NodeMeta;

    /// Identity token; cheap and lock-free, used on walk paths.
    fn qid(&self) -> Qid {
        self.meta().qid()
    }

    /// Content length in bytes. Dynamic files compute it per call.
    async fn length(&self) -> u64 {
        0
    }

    /// Metadata view; `length` must match what a full read would yield
    /// while no mutator runs.
    async fn stat(&self) -> Stat {
        self.meta().stat(self.length().await)
    }

    /// Prepare for I/O.
    fn open(&self, _mode: u8) -> FsResult<()> {
        Ok(())
    }

    /// Read up to `count` bytes at `offset`; empty means end-of-stream.
    async fn read(&self, _offset: u64, _count: u32) -> FsResult<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Write bytes at `offset`, returning the count accepted.
    async fn write(&self, _data: &[u8], _offset: u64) -> FsResult<u32> {
        Err(FsError::PermissionDenied)
    }

    /// Release resources.
    fn close(&self) {}

    /// Directory extension, if this node is one.
    fn as_dir(&self) -> Option<&dyn DirNode> {
        None
    }

    /// Fid-aware extension, if this node keeps per-fid state.
    fn as_fid_aware(&self) -> Option<&dyn FidAwareNode> {
        None
    }
}

/// Extension for directories.
pub trait DirNode: Node {
    /// Children in insertion order.
    fn children(&self) -> Vec<Arc<dyn Node>>;

    /// O(1) lookup by name.
    fn lookup(&self, name: &str) -> FsResult<Arc<dyn Node>>;
}

/// Extension for files whose operations receive the originating fid.
///
/// The dispatcher routes reads and writes through these variants when
/// present and calls `close_fid` on clunk so per-fid state never leaks.
#[async_trait]
pub trait FidAwareNode: Node {
    async fn read_fid(&self, fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>>;

    async fn write_fid(&self, fid: u32, data: &[u8], offset: u64) -> FsResult<u32>;

    fn close_fid(&self, fid: u32);
}

// ============================================================================
// Helpers
// ============================================================================

/// Slice `content` at `offset`, up to `count` bytes; empty at or past end.
pub fn read_slice(content: &[u8], offset: u64, count: u32) -> Vec<u8> {
    if offset >= content.len() as u64 {
        return Vec::new();
    }
    let start = offset as usize;
    let end = (start + count as usize).min(content.len());
    content[start..end].to_vec()
}

/// Textual read convention: non-empty content is newline-terminated.
pub fn terminated(text: &str) -> String {
    if text.is_empty() || text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}

/// Decode a write payload and trim trailing whitespace.
pub fn write_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim().to_string()
}

// ============================================================================
// Static nodes
// ============================================================================

/// Immutable file with fixed content.
pub struct StaticFile {
    meta: NodeMeta,
    content: Vec<u8>,
}

impl StaticFile {
    pub fn new(name: &str, content: &[u8]) -> Self {
        Self {
            meta: NodeMeta::new(name, 0o444),
            content: content.to_vec(),
        }
    }
}

#[async_trait]
impl Node for StaticFile {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    async fn length(&self) -> u64 {
        self.content.len() as u64
    }

    async fn read(&self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        Ok(read_slice(&self.content, offset, count))
    }
}

#[derive(Default)]
struct DirInner {
    order: Vec<String>,
    children: std::collections::HashMap<String, Arc<dyn Node>>,
}

/// Directory with a fixed, insertion-ordered set of children.
///
/// Reading serialises the children as back-to-back Stat records; partial
/// reads slice that byte stream by offset.
pub struct StaticDir {
    meta: NodeMeta,
    inner: RwLock<DirInner>,
}

impl StaticDir {
    pub fn new(name: &str) -> Self {
        Self {
            meta: NodeMeta::new(name, file_mode::DMDIR | 0o555),
            inner: RwLock::new(DirInner::default()),
        }
    }

    /// Add a child, keeping first-insertion order for listings.
    pub fn add(&self, child: Arc<dyn Node>) {
        let name = child.meta().name().to_string();
        let mut inner = self.inner.write();
        if !inner.children.contains_key(&name) {
            inner.order.push(name.clone());
        }
        inner.children.insert(name, child);
    }
}

#[async_trait]
impl Node for StaticDir {
    fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    async fn read(&self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let mut packed = Vec::new();
        for child in self.children() {
            let stat = child.stat().await;
            stat.encode(&mut packed);
        }
        Ok(read_slice(&packed, offset, count))
    }

    fn as_dir(&self) -> Option<&dyn DirNode> {
        Some(self)
    }
}

impl DirNode for StaticDir {
    fn children(&self) -> Vec<Arc<dyn Node>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|name| inner.children.get(name).cloned())
            .collect()
    }

    fn lookup(&self, name: &str) -> FsResult<Arc<dyn Node>> {
        self.inner
            .read()
            .children
            .get(name)
            .cloned()
            .ok_or(FsError::NotFound)
    }
}
