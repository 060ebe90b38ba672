//! 9P2000 wire protocol implementation.
//!
//! This crate implements the subset of 9P2000 needed to serve a fixed
//! virtual file tree: version, attach, walk, open, read, write, clunk,
//! stat, and flush. Everything is little-endian; strings are a `u16`
//! length followed by UTF-8 bytes.
//!
//! Each message on the stream is a size-prefixed frame:
//!
//! ```text
//! size[4] type[1] tag[2] payload[size-7]
//! ```
//!
//! where `size` counts its own four bytes. [`message`] holds the typed
//! T-/R-message enums and their payload codecs; [`codec`] holds the
//! async frame reader/writer.

pub mod codec;
pub mod message;
mod wire;

pub use message::{Rmessage, Tmessage};

use thiserror::Error;

/// Protocol version string this server implements.
pub const VERSION: &str = "9P2000";

/// Inferno's name for the same wire protocol; accepted as an alias.
pub const VERSION_STYX: &str = "Styx";

/// Default maximum size of a 9P message frame.
pub const MAX_MESSAGE_SIZE: u32 = 8192;

/// Tag value used only for version negotiation.
pub const NOTAG: u16 = 0xFFFF;

/// Fid value meaning "no fid" (e.g. Tattach with no auth fid).
pub const NOFID: u32 = 0xFFFF_FFFF;

/// Message type codes. T-codes are client requests, R-codes server replies.
pub mod msg_type {
    pub const TVERSION: u8 = 100;
    pub const RVERSION: u8 = 101;
    pub const TAUTH: u8 = 102;
    pub const RAUTH: u8 = 103;
    pub const TATTACH: u8 = 104;
    pub const RATTACH: u8 = 105;
    pub const RERROR: u8 = 107;
    pub const TFLUSH: u8 = 108;
    pub const RFLUSH: u8 = 109;
    pub const TWALK: u8 = 110;
    pub const RWALK: u8 = 111;
    pub const TOPEN: u8 = 112;
    pub const ROPEN: u8 = 113;
    pub const TCREATE: u8 = 114;
    pub const RCREATE: u8 = 115;
    pub const TREAD: u8 = 116;
    pub const RREAD: u8 = 117;
    pub const TWRITE: u8 = 118;
    pub const RWRITE: u8 = 119;
    pub const TCLUNK: u8 = 120;
    pub const RCLUNK: u8 = 121;
    pub const TREMOVE: u8 = 122;
    pub const RREMOVE: u8 = 123;
    pub const TSTAT: u8 = 124;
    pub const RSTAT: u8 = 125;
    pub const TWSTAT: u8 = 126;
    pub const RWSTAT: u8 = 127;
}

/// Open modes (low bits of the Topen mode byte).
pub mod open_mode {
    /// Open for reading.
    pub const READ: u8 = 0;
    /// Open for writing.
    pub const WRITE: u8 = 1;
    /// Open for reading and writing.
    pub const RDWR: u8 = 2;
    /// Execute (unused here, carried for completeness).
    pub const EXEC: u8 = 3;
    /// OR-able flag: truncate the file on open.
    pub const TRUNC: u8 = 16;
}

/// File mode flags (high bits of `Stat::mode`).
pub mod file_mode {
    /// Directory.
    pub const DMDIR: u32 = 0x8000_0000;
    /// Append-only file.
    pub const DMAPPEND: u32 = 0x4000_0000;
    /// Exclusive-use file.
    pub const DMEXCL: u32 = 0x2000_0000;
    /// Temporary file.
    pub const DMTMP: u32 = 0x0400_0000;
}

/// Qid type byte values.
pub mod qid_type {
    /// Directory.
    pub const DIR: u8 = 0x80;
    /// Append-only file.
    pub const APPEND: u8 = 0x40;
    /// Exclusive-use file.
    pub const EXCL: u8 = 0x20;
    /// Temporary file.
    pub const TMP: u8 = 0x04;
    /// Regular file.
    pub const FILE: u8 = 0x00;
}

/// Errors produced while framing or decoding 9P messages.
///
/// The `Display` strings of the size-bound variants are exactly what goes
/// out on the wire in an `Rerror` before the connection is closed.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Frame size field below the 7-byte minimum.
    #[error("message too small: {0}")]
    MessageTooSmall(u32),

    /// Frame size field above the negotiated maximum.
    #[error("message too large: {0}")]
    MessageTooLarge(u32),

    /// A payload field extends past the end of the frame.
    #[error("truncated message")]
    Truncated,

    /// A message type this server does not implement.
    #[error("unknown message type: {0}")]
    UnknownType(u8),

    /// Transport-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Unique identity token the server attaches to every node.
///
/// `path` names the node for the lifetime of the process; `version` is
/// bumped whenever the node's content changes so clients can invalidate
/// caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qid {
    /// Node kind (see [`qid_type`]).
    pub qtype: u8,
    /// Content version, advanced on mutation.
    pub version: u32,
    /// Process-unique node identifier.
    pub path: u64,
}

/// Encoded size of a Qid on the wire.
pub const QID_SIZE: usize = 13;

impl Qid {
    /// Returns true if this qid names a directory.
    pub fn is_dir(&self) -> bool {
        self.qtype & qid_type::DIR != 0
    }

    /// Append the 13-byte wire form to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.qtype);
        wire::put_u32(buf, self.version);
        wire::put_u64(buf, self.path);
    }

    pub(crate) fn decode(cur: &mut wire::Cursor<'_>) -> ProtoResult<Qid> {
        Ok(Qid {
            qtype: cur.u8()?,
            version: cur.u32()?,
            path: cur.u64()?,
        })
    }
}

/// File metadata as carried by Rstat and directory reads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stat {
    /// Server type (unused, zero).
    pub srv_type: u16,
    /// Server device (unused, zero).
    pub dev: u32,
    /// Node identity.
    pub qid: Qid,
    /// Permission bits plus [`file_mode`] flags.
    pub mode: u32,
    /// Last access time (Unix seconds).
    pub atime: u32,
    /// Last modification time (Unix seconds).
    pub mtime: u32,
    /// Content length in bytes.
    pub length: u64,
    /// File name.
    pub name: String,
    /// Owner label.
    pub uid: String,
    /// Group label.
    pub gid: String,
    /// Last-modifier label.
    pub muid: String,
}

impl Stat {
    /// Append the wire form to `buf`, returning the number of bytes written.
    ///
    /// The leading `u16` is the size of everything that follows it,
    /// excluding itself.
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        wire::put_u16(buf, 0); // size, patched below
        wire::put_u16(buf, self.srv_type);
        wire::put_u32(buf, self.dev);
        self.qid.encode(buf);
        wire::put_u32(buf, self.mode);
        wire::put_u32(buf, self.atime);
        wire::put_u32(buf, self.mtime);
        wire::put_u64(buf, self.length);
        wire::put_str(buf, &self.name);
        wire::put_str(buf, &self.uid);
        wire::put_str(buf, &self.gid);
        wire::put_str(buf, &self.muid);
        let size = (buf.len() - start - 2) as u16;
        buf[start..start + 2].copy_from_slice(&size.to_le_bytes());
        buf.len() - start
    }

    /// Wire form as an owned buffer (one packed directory entry).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.encode(&mut buf);
        buf
    }

    pub(crate) fn decode(cur: &mut wire::Cursor<'_>) -> ProtoResult<Stat> {
        let _size = cur.u16()?;
        Ok(Stat {
            srv_type: cur.u16()?,
            dev: cur.u32()?,
            qid: Qid::decode(cur)?,
            mode: cur.u32()?,
            atime: cur.u32()?,
            mtime: cur.u32()?,
            length: cur.u64()?,
            name: cur.string()?,
            uid: cur.string()?,
            gid: cur.string()?,
            muid: cur.string()?,
        })
    }
}

/// Human-readable name of a message type code, for debug logging.
pub fn message_name(t: u8) -> &'static str {
    use msg_type::*;
    match t {
        TVERSION => "Tversion",
        RVERSION => "Rversion",
        TAUTH => "Tauth",
        RAUTH => "Rauth",
        TATTACH => "Tattach",
        RATTACH => "Rattach",
        RERROR => "Rerror",
        TFLUSH => "Tflush",
        RFLUSH => "Rflush",
        TWALK => "Twalk",
        RWALK => "Rwalk",
        TOPEN => "Topen",
        ROPEN => "Ropen",
        TCREATE => "Tcreate",
        RCREATE => "Rcreate",
        TREAD => "Tread",
        RREAD => "Rread",
        TWRITE => "Twrite",
        RWRITE => "Rwrite",
        TCLUNK => "Tclunk",
        RCLUNK => "Rclunk",
        TREMOVE => "Tremove",
        RREMOVE => "Rremove",
        TSTAT => "Tstat",
        RSTAT => "Rstat",
        TWSTAT => "Twstat",
        RWSTAT => "Rwstat",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qid_roundtrip() {
        let qid = Qid {
            qtype: qid_type::DIR,
            version: 7,
            path: 0xDEAD_BEEF,
        };
        let mut buf = Vec::new();
        qid.encode(&mut buf);
        assert_eq!(buf.len(), QID_SIZE);

        let mut cur = wire::Cursor::new(&buf);
        let decoded = Qid::decode(&mut cur).unwrap();
        assert_eq!(decoded, qid);
        assert!(decoded.is_dir());
    }

    #[test]
    fn test_stat_roundtrip() {
        let stat = Stat {
            qid: Qid {
                qtype: qid_type::FILE,
                version: 3,
                path: 42,
            },
            mode: 0o666,
            atime: 1700000000,
            mtime: 1700000001,
            length: 1234,
            name: "ask".into(),
            uid: "llm".into(),
            gid: "llm".into(),
            muid: "llm".into(),
            ..Default::default()
        };

        let buf = stat.to_bytes();
        let mut cur = wire::Cursor::new(&buf);
        let decoded = Stat::decode(&mut cur).unwrap();
        assert_eq!(decoded, stat);
    }

    #[test]
    fn test_stat_size_field_excludes_itself() {
        let stat = Stat {
            name: "x".into(),
            ..Default::default()
        };
        let buf = stat.to_bytes();
        let size = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        assert_eq!(size, buf.len() - 2);
    }

    #[test]
    fn test_stat_fixed_layout() {
        // Fixed fields: size(2) type(2) dev(4) qid(13) mode(4)
        // atime(4) mtime(4) length(8), then four strings of 2 bytes each
        // when empty.
        let stat = Stat::default();
        let buf = stat.to_bytes();
        assert_eq!(buf.len(), 2 + 2 + 4 + 13 + 4 + 4 + 4 + 8 + 4 * 2);
    }

    #[test]
    fn test_message_name() {
        assert_eq!(message_name(msg_type::TVERSION), "Tversion");
        assert_eq!(message_name(msg_type::RERROR), "Rerror");
        assert_eq!(message_name(1), "unknown");
    }
}
