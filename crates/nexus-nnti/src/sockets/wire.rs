//! Frame codec for the sockets fabric.
//!
//! Every frame is `[u32 len][u8 tag][payload]` (len counts tag + payload).
//! REQUEST/CREDIT/LONG_GET_ACK are the mailbox protocol; the remaining tags
//! are this fabric's one-sided service path — the peer's progress thread
//! executes GET/PUT/ATOMIC requests against its registered-buffer map, which
//! is how a fabric without an rdma NIC renders one-sided semantics.

use std::io::{Read, Write};

use crate::error::{NntiError, NntiResult};
use crate::packable::{put_i64, put_u16, put_u32, put_u64, Cursor};

pub mod tags {
    pub const HELLO: u8 = 1;
    pub const REQUEST: u8 = 2;
    pub const CREDIT: u8 = 3;
    pub const LONG_GET_ACK: u8 = 4;
    pub const GET_REQ: u8 = 5;
    pub const GET_RESP: u8 = 6;
    pub const PUT_REQ: u8 = 7;
    pub const PUT_ACK: u8 = 8;
    pub const ATOMIC_REQ: u8 = 9;
    pub const ATOMIC_RESP: u8 = 10;
    pub const GOODBYE: u8 = 11;
}

/// Request ids with this bit set belong to synchronous retrievals rather
/// than op-vector slots.
pub const BLOCKING_REQ_BIT: u32 = 0x8000_0000;

/// Frames larger than this are treated as stream corruption.
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

pub mod req_flags {
    /// Fire an event at the serving side too.
    pub const REMOTE_EVENT: u8 = 1;
    /// PUT only: acknowledge completion back to the initiator.
    pub const WANT_ACK: u8 = 2;
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

pub fn write_frame(w: &mut impl Write, tag: u8, payload: &[u8]) -> std::io::Result<()> {
    let len = (payload.len() + 1) as u32;
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.extend_from_slice(&len.to_le_bytes());
    out.push(tag);
    out.extend_from_slice(payload);
    w.write_all(&out)
}

pub fn read_frame(r: &mut impl Read) -> std::io::Result<Frame> {
    let mut len_raw = [0u8; 4];
    r.read_exact(&mut len_raw)?;
    let len = u32::from_le_bytes(len_raw);
    if len == 0 || len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad frame length",
        ));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    let tag = body[0];
    body.remove(0);
    Ok(Frame { tag, payload: body })
}

// -- payload builders/parsers ------------------------------------------------

pub fn build_hello(target_conn_index: u32, pid: u64, url: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + url.len());
    put_u32(&mut out, target_conn_index);
    put_u64(&mut out, pid);
    put_u16(&mut out, url.len() as u16);
    out.extend_from_slice(url.as_bytes());
    out
}

pub fn parse_hello(raw: &[u8]) -> NntiResult<(u32, u64, String)> {
    let mut c = Cursor::new(raw);
    let index = c.u32()?;
    let pid = c.u64()?;
    let ulen = c.u16()? as usize;
    let url = String::from_utf8(c.take(ulen)?.to_vec()).map_err(|_| NntiError::Decode)?;
    Ok((index, pid, url))
}

pub fn build_credit(count: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    put_u32(&mut out, count);
    out
}

pub fn parse_credit(raw: &[u8]) -> NntiResult<u32> {
    Cursor::new(raw).u32()
}

pub fn build_long_get_ack(src_op_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    put_u32(&mut out, src_op_id);
    out
}

pub fn parse_long_get_ack(raw: &[u8]) -> NntiResult<u32> {
    Cursor::new(raw).u32()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetReq {
    pub req_id: u32,
    pub flags: u8,
    pub base: u64,
    pub offset: u64,
    pub length: u64,
}

pub fn build_get_req(g: &GetReq) -> Vec<u8> {
    let mut out = Vec::with_capacity(29);
    put_u32(&mut out, g.req_id);
    out.push(g.flags);
    put_u64(&mut out, g.base);
    put_u64(&mut out, g.offset);
    put_u64(&mut out, g.length);
    out
}

pub fn parse_get_req(raw: &[u8]) -> NntiResult<GetReq> {
    let mut c = Cursor::new(raw);
    Ok(GetReq {
        req_id: c.u32()?,
        flags: c.u8()?,
        base: c.u64()?,
        offset: c.u64()?,
        length: c.u64()?,
    })
}

pub fn build_get_resp(req_id: u32, code: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + data.len());
    put_u32(&mut out, req_id);
    out.push(code);
    out.extend_from_slice(data);
    out
}

pub fn parse_get_resp(raw: &[u8]) -> NntiResult<(u32, u8, &[u8])> {
    let mut c = Cursor::new(raw);
    let req_id = c.u32()?;
    let code = c.u8()?;
    let data = c.take(c.remaining())?;
    Ok((req_id, code, data))
}

#[derive(Debug, Clone)]
pub struct PutReq<'a> {
    pub req_id: u32,
    pub flags: u8,
    pub base: u64,
    pub offset: u64,
    pub data: &'a [u8],
}

pub fn build_put_req(p: &PutReq<'_>) -> Vec<u8> {
    let mut out = Vec::with_capacity(21 + p.data.len());
    put_u32(&mut out, p.req_id);
    out.push(p.flags);
    put_u64(&mut out, p.base);
    put_u64(&mut out, p.offset);
    out.extend_from_slice(p.data);
    out
}

pub fn parse_put_req(raw: &[u8]) -> NntiResult<PutReq<'_>> {
    let mut c = Cursor::new(raw);
    let req_id = c.u32()?;
    let flags = c.u8()?;
    let base = c.u64()?;
    let offset = c.u64()?;
    let data = c.take(c.remaining())?;
    Ok(PutReq { req_id, flags, base, offset, data })
}

pub fn build_put_ack(req_id: u32, code: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    put_u32(&mut out, req_id);
    out.push(code);
    out
}

pub fn parse_put_ack(raw: &[u8]) -> NntiResult<(u32, u8)> {
    let mut c = Cursor::new(raw);
    Ok((c.u32()?, c.u8()?))
}

pub mod atomic_kind {
    pub const FADD: u8 = 1;
    pub const CSWAP: u8 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicReq {
    pub req_id: u32,
    pub kind: u8,
    pub base: u64,
    pub offset: u64,
    pub operand1: i64,
    pub operand2: i64,
}

pub fn build_atomic_req(a: &AtomicReq) -> Vec<u8> {
    let mut out = Vec::with_capacity(37);
    put_u32(&mut out, a.req_id);
    out.push(a.kind);
    put_u64(&mut out, a.base);
    put_u64(&mut out, a.offset);
    put_i64(&mut out, a.operand1);
    put_i64(&mut out, a.operand2);
    out
}

pub fn parse_atomic_req(raw: &[u8]) -> NntiResult<AtomicReq> {
    let mut c = Cursor::new(raw);
    Ok(AtomicReq {
        req_id: c.u32()?,
        kind: c.u8()?,
        base: c.u64()?,
        offset: c.u64()?,
        operand1: c.i64()?,
        operand2: c.i64()?,
    })
}

pub fn build_atomic_resp(req_id: u32, code: u8, old: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    put_u32(&mut out, req_id);
    out.push(code);
    put_i64(&mut out, old);
    out
}

pub fn parse_atomic_resp(raw: &[u8]) -> NntiResult<(u32, u8, i64)> {
    let mut c = Cursor::new(raw);
    Ok((c.u32()?, c.u8()?, c.i64()?))
}

// -- error code mapping ------------------------------------------------------

pub const CODE_OK: u8 = 0;

pub fn err_to_code(e: NntiError) -> u8 {
    match e {
        NntiError::Perm => 1,
        NntiError::Noent => 2,
        NntiError::Inval => 3,
        NntiError::Nomem => 4,
        NntiError::Align => 5,
        _ => 255,
    }
}

pub fn code_to_err(c: u8) -> Option<NntiError> {
    match c {
        CODE_OK => None,
        1 => Some(NntiError::Perm),
        2 => Some(NntiError::Noent),
        3 => Some(NntiError::Inval),
        4 => Some(NntiError::Nomem),
        5 => Some(NntiError::Align),
        _ => Some(NntiError::Io),
    }
}
