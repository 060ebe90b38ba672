//! Typed 9P messages and their payload codecs.
//!
//! [`Tmessage`] is what clients send, [`Rmessage`] what the server answers.
//! Payload encoding excludes the frame header (size, type, tag) — that is
//! the job of [`crate::codec`]. Both directions encode and decode so that
//! tests and in-process clients can speak the full protocol.

use crate::wire::{self, Cursor};
use crate::{msg_type, ProtoError, ProtoResult, Qid, Stat};

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tmessage {
    /// Negotiate protocol version and maximum message size.
    Version { msize: u32, version: String },
    /// Bind `fid` to the filesystem root.
    Attach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    /// Resolve path components starting from `fid`, binding `newfid`.
    Walk {
        fid: u32,
        newfid: u32,
        names: Vec<String>,
    },
    /// Prepare `fid` for I/O.
    Open { fid: u32, mode: u8 },
    /// Read `count` bytes at `offset`.
    Read { fid: u32, offset: u64, count: u32 },
    /// Write bytes at `offset`.
    Write { fid: u32, offset: u64, data: Vec<u8> },
    /// Release `fid`.
    Clunk { fid: u32 },
    /// Fetch metadata for `fid`.
    Stat { fid: u32 },
    /// Cancel the request with tag `oldtag`.
    Flush { oldtag: u16 },
}

/// A server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rmessage {
    Version { msize: u32, version: String },
    Attach { qid: Qid },
    Walk { qids: Vec<Qid> },
    Open { qid: Qid, iounit: u32 },
    Read { data: Vec<u8> },
    Write { count: u32 },
    Clunk,
    Stat(Stat),
    Flush,
    Error { ename: String },
}

impl Tmessage {
    /// Wire type code for this message.
    pub fn type_code(&self) -> u8 {
        match self {
            Tmessage::Version { .. } => msg_type::TVERSION,
            Tmessage::Attach { .. } => msg_type::TATTACH,
            Tmessage::Walk { .. } => msg_type::TWALK,
            Tmessage::Open { .. } => msg_type::TOPEN,
            Tmessage::Read { .. } => msg_type::TREAD,
            Tmessage::Write { .. } => msg_type::TWRITE,
            Tmessage::Clunk { .. } => msg_type::TCLUNK,
            Tmessage::Stat { .. } => msg_type::TSTAT,
            Tmessage::Flush { .. } => msg_type::TFLUSH,
        }
    }

    /// Encode the payload (everything after the frame header).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        match self {
            Tmessage::Version { msize, version } => {
                wire::put_u32(&mut buf, *msize);
                wire::put_str(&mut buf, version);
            }
            Tmessage::Attach {
                fid,
                afid,
                uname,
                aname,
            } => {
                wire::put_u32(&mut buf, *fid);
                wire::put_u32(&mut buf, *afid);
                wire::put_str(&mut buf, uname);
                wire::put_str(&mut buf, aname);
            }
            Tmessage::Walk { fid, newfid, names } => {
                wire::put_u32(&mut buf, *fid);
                wire::put_u32(&mut buf, *newfid);
                wire::put_u16(&mut buf, names.len() as u16);
                for name in names {
                    wire::put_str(&mut buf, name);
                }
            }
            Tmessage::Open { fid, mode } => {
                wire::put_u32(&mut buf, *fid);
                buf.push(*mode);
            }
            Tmessage::Read { fid, offset, count } => {
                wire::put_u32(&mut buf, *fid);
                wire::put_u64(&mut buf, *offset);
                wire::put_u32(&mut buf, *count);
            }
            Tmessage::Write { fid, offset, data } => {
                wire::put_u32(&mut buf, *fid);
                wire::put_u64(&mut buf, *offset);
                wire::put_u32(&mut buf, data.len() as u32);
                buf.extend_from_slice(data);
            }
            Tmessage::Clunk { fid } | Tmessage::Stat { fid } => {
                wire::put_u32(&mut buf, *fid);
            }
            Tmessage::Flush { oldtag } => {
                wire::put_u16(&mut buf, *oldtag);
            }
        }
        buf
    }

    /// Decode a payload of the given wire type.
    ///
    /// Any field running past the payload end is a
    /// [`ProtoError::Truncated`]; in particular a Twrite whose count
    /// exceeds the remaining bytes is rejected rather than clamped.
    pub fn decode(mtype: u8, payload: &[u8]) -> ProtoResult<Tmessage> {
        let mut cur = Cursor::new(payload);
        let msg = match mtype {
            msg_type::TVERSION => Tmessage::Version {
                msize: cur.u32()?,
                version: cur.string()?,
            },
            msg_type::TATTACH => Tmessage::Attach {
                fid: cur.u32()?,
                afid: cur.u32()?,
                uname: cur.string()?,
                aname: cur.string()?,
            },
            msg_type::TWALK => {
                let fid = cur.u32()?;
                let newfid = cur.u32()?;
                let nwname = cur.u16()?;
                let mut names = Vec::with_capacity(nwname as usize);
                for _ in 0..nwname {
                    names.push(cur.string()?);
                }
                Tmessage::Walk { fid, newfid, names }
            }
            msg_type::TOPEN => Tmessage::Open {
                fid: cur.u32()?,
                mode: cur.u8()?,
            },
            msg_type::TREAD => Tmessage::Read {
                fid: cur.u32()?,
                offset: cur.u64()?,
                count: cur.u32()?,
            },
            msg_type::TWRITE => {
                let fid = cur.u32()?;
                let offset = cur.u64()?;
                let count = cur.u32()? as usize;
                let data = cur.bytes(count)?;
                Tmessage::Write { fid, offset, data }
            }
            msg_type::TCLUNK => Tmessage::Clunk { fid: cur.u32()? },
            msg_type::TSTAT => Tmessage::Stat { fid: cur.u32()? },
            msg_type::TFLUSH => Tmessage::Flush {
                oldtag: cur.u16()?,
            },
            other => return Err(ProtoError::UnknownType(other)),
        };
        Ok(msg)
    }
}

impl Rmessage {
    /// Wire type code for this message.
    pub fn type_code(&self) -> u8 {
        match self {
            Rmessage::Version { .. } => msg_type::RVERSION,
            Rmessage::Attach { .. } => msg_type::RATTACH,
            Rmessage::Walk { .. } => msg_type::RWALK,
            Rmessage::Open { .. } => msg_type::ROPEN,
            Rmessage::Read { .. } => msg_type::RREAD,
            Rmessage::Write { .. } => msg_type::RWRITE,
            Rmessage::Clunk => msg_type::RCLUNK,
            Rmessage::Stat(_) => msg_type::RSTAT,
            Rmessage::Flush => msg_type::RFLUSH,
            Rmessage::Error { .. } => msg_type::RERROR,
        }
    }

    /// Encode the payload (everything after the frame header).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        match self {
            Rmessage::Version { msize, version } => {
                wire::put_u32(&mut buf, *msize);
                wire::put_str(&mut buf, version);
            }
            Rmessage::Attach { qid } => qid.encode(&mut buf),
            Rmessage::Walk { qids } => {
                wire::put_u16(&mut buf, qids.len() as u16);
                for qid in qids {
                    qid.encode(&mut buf);
                }
            }
            Rmessage::Open { qid, iounit } => {
                qid.encode(&mut buf);
                wire::put_u32(&mut buf, *iounit);
            }
            Rmessage::Read { data } => {
                wire::put_u32(&mut buf, data.len() as u32);
                buf.extend_from_slice(data);
            }
            Rmessage::Write { count } => {
                wire::put_u32(&mut buf, *count);
            }
            Rmessage::Clunk | Rmessage::Flush => {}
            Rmessage::Stat(stat) => {
                // Rstat carries an extra u16 length on top of the Stat's
                // own size field. A wart of the protocol, kept bit-exact.
                let stat_bytes = stat.to_bytes();
                wire::put_u16(&mut buf, stat_bytes.len() as u16);
                buf.extend_from_slice(&stat_bytes);
            }
            Rmessage::Error { ename } => {
                wire::put_str(&mut buf, ename);
            }
        }
        buf
    }

    /// Decode a payload of the given wire type.
    pub fn decode(mtype: u8, payload: &[u8]) -> ProtoResult<Rmessage> {
        let mut cur = Cursor::new(payload);
        let msg = match mtype {
            msg_type::RVERSION => Rmessage::Version {
                msize: cur.u32()?,
                version: cur.string()?,
            },
            msg_type::RATTACH => Rmessage::Attach {
                qid: Qid::decode(&mut cur)?,
            },
            msg_type::RWALK => {
                let nwqid = cur.u16()?;
                let mut qids = Vec::with_capacity(nwqid as usize);
                for _ in 0..nwqid {
                    qids.push(Qid::decode(&mut cur)?);
                }
                Rmessage::Walk { qids }
            }
            msg_type::ROPEN => Rmessage::Open {
                qid: Qid::decode(&mut cur)?,
                iounit: cur.u32()?,
            },
            msg_type::RREAD => {
                let count = cur.u32()? as usize;
                Rmessage::Read {
                    data: cur.bytes(count)?,
                }
            }
            msg_type::RWRITE => Rmessage::Write { count: cur.u32()? },
            msg_type::RCLUNK => Rmessage::Clunk,
            msg_type::RSTAT => {
                let _outer = cur.u16()?;
                Rmessage::Stat(Stat::decode(&mut cur)?)
            }
            msg_type::RFLUSH => Rmessage::Flush,
            msg_type::RERROR => Rmessage::Error {
                ename: cur.string()?,
            },
            other => return Err(ProtoError::UnknownType(other)),
        };
        Ok(msg)
    }
}
