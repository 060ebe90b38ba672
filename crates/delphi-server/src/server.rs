//! The 9P connection server.
//!
//! One task per accepted connection, each owning an independent fid table
//! and its negotiated msize. Requests on a connection are served strictly
//! in arrival order; concurrency comes from running many connections, not
//! from reordering within one.

use std::collections::HashMap;
use std::sync::Arc;

use delphi_proto::{
    codec, message_name, ProtoError, Qid, Rmessage, Tmessage, MAX_MESSAGE_SIZE, NOTAG, VERSION,
    VERSION_STYX,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::fs::{FsError, Node};

/// Per-connection state: the fid table and the negotiated message size.
struct ConnState {
    fids: HashMap<u32, Arc<dyn Node>>,
    msize: u32,
}

impl ConnState {
    fn new(msize: u32) -> Self {
        Self {
            fids: HashMap::new(),
            msize,
        }
    }
}

/// 9P file server over a fixed node tree.
pub struct Server {
    root: Arc<dyn Node>,
    max_msize: u32,
    debug: bool,
}

impl Server {
    /// New server exposing `root`.
    pub fn new(root: Arc<dyn Node>) -> Self {
        Self {
            root,
            max_msize: MAX_MESSAGE_SIZE,
            debug: false,
        }
    }

    /// Log a summary line for every T- and R-message.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Accept connections until the listener fails or the task is dropped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "client connected");
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_conn(stream).await;
                info!(%peer, "client disconnected");
            });
        }
    }

    /// Serve a single bidirectional stream to completion.
    ///
    /// Generic over the transport so tests can drive an in-memory duplex
    /// pipe through the same code path as TCP.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut conn = ConnState::new(self.max_msize);

        loop {
            let (mtype, tag, payload) = match codec::read_frame(&mut reader, conn.msize).await {
                Ok(frame) => frame,
                Err(ProtoError::Io(e)) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        error!(error = %e, "read failed");
                    }
                    break;
                }
                Err(e) => {
                    // Frame-level failure: report once, then close.
                    let reply = Rmessage::Error {
                        ename: e.to_string(),
                    };
                    let _ = codec::write_frame(
                        &mut writer,
                        reply.type_code(),
                        NOTAG,
                        &reply.encode(),
                        self.max_msize,
                    )
                    .await;
                    break;
                }
            };

            if self.debug {
                debug!("< {} tag={} len={}", message_name(mtype), tag, payload.len());
            }

            let (reply, fatal) = match Tmessage::decode(mtype, &payload) {
                Ok(msg) => (self.dispatch(&mut conn, msg).await, false),
                Err(ProtoError::UnknownType(t)) => (
                    Rmessage::Error {
                        ename: format!("unknown message type: {t}"),
                    },
                    false,
                ),
                // A payload that lies about its own length is not worth
                // trusting for another frame.
                Err(e) => (
                    Rmessage::Error {
                        ename: e.to_string(),
                    },
                    true,
                ),
            };

            if self.debug {
                debug!(
                    "> {} tag={} len={}",
                    message_name(reply.type_code()),
                    tag,
                    reply.encode().len()
                );
            }

            let write = codec::write_frame(
                &mut writer,
                reply.type_code(),
                tag,
                &reply.encode(),
                conn.msize,
            )
            .await;
            if let Err(e) = write {
                error!(error = %e, "write failed");
                break;
            }
            if fatal {
                break;
            }
        }

        // Connection teardown clunks every bound fid so fid-aware cleanup
        // hooks run and no session outlives its connection.
        for (fid, node) in conn.fids.drain() {
            if let Some(fa) = node.as_fid_aware() {
                fa.close_fid(fid);
            }
            node.close();
        }
    }

    async fn dispatch(&self, conn: &mut ConnState, msg: Tmessage) -> Rmessage {
        match msg {
            Tmessage::Version { msize, version } => self.handle_version(conn, msize, &version),
            Tmessage::Attach { fid, .. } => self.handle_attach(conn, fid),
            Tmessage::Walk { fid, newfid, names } => self.handle_walk(conn, fid, newfid, &names),
            Tmessage::Open { fid, mode } => self.handle_open(conn, fid, mode),
            Tmessage::Read { fid, offset, count } => {
                self.handle_read(conn, fid, offset, count).await
            }
            Tmessage::Write { fid, offset, data } => {
                self.handle_write(conn, fid, offset, &data).await
            }
            Tmessage::Clunk { fid } => self.handle_clunk(conn, fid),
            Tmessage::Stat { fid } => self.handle_stat(conn, fid).await,
            // No background work can outrun its request turn here, so a
            // flush has nothing to cancel.
            Tmessage::Flush { .. } => Rmessage::Flush,
        }
    }

    fn handle_version(&self, conn: &mut ConnState, msize: u32, version: &str) -> Rmessage {
        conn.fids.clear();
        conn.msize = msize.min(self.max_msize);

        let accepted = if version == VERSION || version == VERSION_STYX {
            version.to_string()
        } else {
            "unknown".to_string()
        };

        debug!(client = version, replying = %accepted, msize = conn.msize, "version negotiation");
        Rmessage::Version {
            msize: conn.msize,
            version: accepted,
        }
    }

    fn handle_attach(&self, conn: &mut ConnState, fid: u32) -> Rmessage {
        if conn.fids.contains_key(&fid) {
            return error_reply(FsError::FidInUse);
        }
        conn.fids.insert(fid, self.root.clone());
        Rmessage::Attach {
            qid: self.root.qid(),
        }
    }

    fn handle_walk(&self, conn: &mut ConnState, fid: u32, newfid: u32, names: &[String]) -> Rmessage {
        let Some(start) = conn.fids.get(&fid) else {
            return error_reply(FsError::BadFid);
        };
        if fid != newfid && conn.fids.contains_key(&newfid) {
            return error_reply(FsError::FidInUse);
        }

        let mut current = start.clone();
        let mut qids: Vec<Qid> = Vec::with_capacity(names.len());

        for name in names {
            let next = {
                let Some(dir) = current.as_dir() else {
                    return error_reply(FsError::NotADirectory);
                };
                match dir.lookup(name) {
                    Ok(next) => next,
                    // Partial walk: report what resolved, leave fids alone.
                    Err(_) => break,
                }
            };
            qids.push(next.qid());
            current = next;
        }

        if qids.len() == names.len() {
            conn.fids.insert(newfid, current);
        }
        Rmessage::Walk { qids }
    }

    fn handle_open(&self, conn: &mut ConnState, fid: u32, mode: u8) -> Rmessage {
        let Some(node) = conn.fids.get(&fid) else {
            return error_reply(FsError::BadFid);
        };
        if let Err(e) = node.open(mode) {
            return error_reply(e);
        }
        Rmessage::Open {
            qid: node.qid(),
            // iounit 0 means "use msize minus overhead".
            iounit: 0,
        }
    }

    async fn handle_read(&self, conn: &mut ConnState, fid: u32, offset: u64, count: u32) -> Rmessage {
        let Some(node) = conn.fids.get(&fid) else {
            return error_reply(FsError::BadFid);
        };

        let max_count = conn.msize.saturating_sub(codec::RREAD_OVERHEAD);
        let count = count.min(max_count);

        let result = match node.as_fid_aware() {
            Some(fa) => fa.read_fid(fid, offset, count).await,
            None => node.read(offset, count).await,
        };

        match result {
            // Empty data is a zero-byte Rread: end-of-stream, not an error.
            Ok(data) => Rmessage::Read { data },
            Err(e) => error_reply(e),
        }
    }

    async fn handle_write(&self, conn: &mut ConnState, fid: u32, offset: u64, data: &[u8]) -> Rmessage {
        let Some(node) = conn.fids.get(&fid) else {
            return error_reply(FsError::BadFid);
        };

        let result = match node.as_fid_aware() {
            Some(fa) => fa.write_fid(fid, data, offset).await,
            None => node.write(data, offset).await,
        };

        match result {
            Ok(count) => Rmessage::Write { count },
            Err(e) => error_reply(e),
        }
    }

    fn handle_clunk(&self, conn: &mut ConnState, fid: u32) -> Rmessage {
        let Some(node) = conn.fids.remove(&fid) else {
            return error_reply(FsError::BadFid);
        };

        if let Some(fa) = node.as_fid_aware() {
            fa.close_fid(fid);
        }
        node.close();
        Rmessage::Clunk
    }

    async fn handle_stat(&self, conn: &mut ConnState, fid: u32) -> Rmessage {
        let Some(node) = conn.fids.get(&fid) else {
            return error_reply(FsError::BadFid);
        };
        Rmessage::Stat(node.stat().await)
    }
}

fn error_reply(err: FsError) -> Rmessage {
    Rmessage::Error {
        ename: err.to_string(),
    }
}
