//! Wire forms of buffers and peers.
//!
//! Descriptors travel as a transport-tagged union, little-endian throughout.
//! The fabric variants mirror what each fabric needs to address memory:
//! verbs carries an rkey, ugni a two-word memory handle, mpi its tag set,
//! and the sockets fabric just the base address (the serving side resolves
//! it against its buffer map).

use crate::error::{NntiError, NntiResult};
use crate::types::TransportId;

// -- little-endian cursor helpers -------------------------------------------

pub(crate) fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> NntiResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(NntiError::Decode);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn u8(&mut self) -> NntiResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> NntiResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> NntiResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> NntiResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> NntiResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

// -- packed buffer ----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackedBuffer {
    Null,
    Ibverbs {
        buf: u64,
        key: u32,
        size: u32,
    },
    Ugni {
        buf: u64,
        size: u32,
        mem_hdl: (u64, u64),
    },
    Mpi {
        cmd_tag: u32,
        get_tag: u32,
        put_tag: u32,
        atomic_tag: u32,
        buf: u64,
        size: u64,
    },
    Sockets {
        buf: u64,
        size: u64,
    },
}

impl PackedBuffer {
    pub fn transport_id(&self) -> TransportId {
        match self {
            PackedBuffer::Null => TransportId::Null,
            PackedBuffer::Ibverbs { .. } => TransportId::Ibverbs,
            PackedBuffer::Ugni { .. } => TransportId::Ugni,
            PackedBuffer::Mpi { .. } => TransportId::Mpi,
            PackedBuffer::Sockets { .. } => TransportId::Sockets,
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        put_u32(&mut out, self.transport_id() as u32);
        match self {
            PackedBuffer::Null => {}
            PackedBuffer::Ibverbs { buf, key, size } => {
                put_u64(&mut out, *buf);
                put_u32(&mut out, *key);
                put_u32(&mut out, *size);
            }
            PackedBuffer::Ugni { buf, size, mem_hdl } => {
                put_u64(&mut out, *buf);
                put_u32(&mut out, *size);
                put_u64(&mut out, mem_hdl.0);
                put_u64(&mut out, mem_hdl.1);
            }
            PackedBuffer::Mpi { cmd_tag, get_tag, put_tag, atomic_tag, buf, size } => {
                put_u32(&mut out, *cmd_tag);
                put_u32(&mut out, *get_tag);
                put_u32(&mut out, *put_tag);
                put_u32(&mut out, *atomic_tag);
                put_u64(&mut out, *buf);
                put_u64(&mut out, *size);
            }
            PackedBuffer::Sockets { buf, size } => {
                put_u64(&mut out, *buf);
                put_u64(&mut out, *size);
            }
        }
        out
    }

    pub fn unpack(raw: &[u8]) -> NntiResult<PackedBuffer> {
        let mut c = Cursor::new(raw);
        let tag = TransportId::from_u32(c.u32()?).ok_or(NntiError::Decode)?;
        match tag {
            TransportId::Null => Ok(PackedBuffer::Null),
            TransportId::Ibverbs => Ok(PackedBuffer::Ibverbs {
                buf: c.u64()?,
                key: c.u32()?,
                size: c.u32()?,
            }),
            TransportId::Ugni => Ok(PackedBuffer::Ugni {
                buf: c.u64()?,
                size: c.u32()?,
                mem_hdl: (c.u64()?, c.u64()?),
            }),
            TransportId::Mpi => Ok(PackedBuffer::Mpi {
                cmd_tag: c.u32()?,
                get_tag: c.u32()?,
                put_tag: c.u32()?,
                atomic_tag: c.u32()?,
                buf: c.u64()?,
                size: c.u64()?,
            }),
            TransportId::Sockets => Ok(PackedBuffer::Sockets {
                buf: c.u64()?,
                size: c.u64()?,
            }),
        }
    }
}

// -- packed peer ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedPeer {
    pub pid: u64,
    pub transport: TransportId,
    pub hostname: String,
    pub port: u16,
}

impl PackedPeer {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.hostname.len());
        put_u64(&mut out, self.pid);
        put_u32(&mut out, self.transport as u32);
        put_u16(&mut out, self.port);
        put_u16(&mut out, self.hostname.len() as u16);
        out.extend_from_slice(self.hostname.as_bytes());
        out
    }

    pub fn unpack(raw: &[u8]) -> NntiResult<PackedPeer> {
        let mut c = Cursor::new(raw);
        let pid = c.u64()?;
        let transport = TransportId::from_u32(c.u32()?).ok_or(NntiError::Decode)?;
        let port = c.u16()?;
        let hlen = c.u16()? as usize;
        let hostname = String::from_utf8(c.take(hlen)?.to_vec()).map_err(|_| NntiError::Decode)?;
        Ok(PackedPeer { pid, transport, hostname, port })
    }
}
