//! Command messages — the fixed-layout slot that carries every short send
//! and every rendezvous setup.
//!
//! Little-endian layout:
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 8    | initiator pid |
//! | 8      | 8    | initiator_offset |
//! | 16     | 8    | target_offset |
//! | 24     | 8    | payload_length |
//! | 32     | 8    | target_base_addr (0 ⇒ unexpected) |
//! | 40     | 4    | op id |
//! | 44     | 4    | src_op_id (ack correlation) |
//! | 48     | 164  | packed initiator buffer handle (leading u32 0 ⇒ absent) |
//! | 212    | rest | eager payload |
//!
//! A message is eager when the whole payload fits behind the header. Long
//! messages instead carry the alignment padding inline: the first `k` bytes
//! (bringing the source address up to the rdma alignment) followed by the
//! trailing `(length-k) % ALIGN` bytes, so the target's get can run over the
//! aligned middle and still reassemble the payload byte-for-byte.

use crate::buffer::Buffer;
use crate::error::{NntiError, NntiResult};
use crate::packable::PackedBuffer;
use crate::types::{PACKED_BUFFER_MAX, RDMA_ALIGNMENT};
use crate::wr::WorkRequest;

pub const HEADER_FIXED: usize = 48;
pub const HEADER_LEN: usize = HEADER_FIXED + PACKED_BUFFER_MAX;

/// Distance from `addr` up to the next alignment boundary.
pub fn alignment_pad(addr: u64) -> u64 {
    (RDMA_ALIGNMENT - (addr % RDMA_ALIGNMENT)) % RDMA_ALIGNMENT
}

/// Head/tail inline split for a long transfer from `src_addr` of `length`
/// bytes: `(k, extra, aligned_middle)`.
pub fn long_split(src_addr: u64, length: u64) -> (u64, u64, u64) {
    let k = alignment_pad(src_addr);
    let extra = (length - k) % RDMA_ALIGNMENT;
    (k, extra, length - k - extra)
}

pub struct CmdMsg {
    bytes: Vec<u8>,
}

impl CmdMsg {
    pub fn eager_capacity(slot_size: u32) -> u64 {
        slot_size as u64 - HEADER_LEN as u64
    }

    /// Pack a work request into slot form at the initiator.
    pub fn pack(
        op_id: u32,
        src_op_id: u32,
        wr: &WorkRequest,
        initiator_pid: u64,
        slot_size: u32,
    ) -> NntiResult<CmdMsg> {
        let mut bytes = vec![0u8; HEADER_LEN];

        bytes[0..8].copy_from_slice(&initiator_pid.to_le_bytes());
        bytes[8..16].copy_from_slice(&wr.local_offset.to_le_bytes());
        bytes[16..24].copy_from_slice(&wr.remote_offset.to_le_bytes());
        bytes[24..32].copy_from_slice(&wr.length.to_le_bytes());
        let target_base = wr.remote_hdl.as_ref().map(|b| b.base()).unwrap_or(0);
        bytes[32..40].copy_from_slice(&target_base.to_le_bytes());
        bytes[40..44].copy_from_slice(&op_id.to_le_bytes());
        bytes[44..48].copy_from_slice(&src_op_id.to_le_bytes());

        if let Some(local) = &wr.local_hdl {
            let packed = PackedBuffer::Sockets {
                buf: local.base(),
                size: local.length(),
            }
            .pack();
            if packed.len() > PACKED_BUFFER_MAX {
                return Err(NntiError::Encode);
            }
            bytes[HEADER_FIXED..HEADER_FIXED + packed.len()].copy_from_slice(&packed);
        }

        let eager = wr.length <= Self::eager_capacity(slot_size);
        if wr.length > 0 {
            let local = wr.local_hdl.as_ref().ok_or(NntiError::Inval)?;
            if eager {
                let payload = local.read_bytes(wr.local_offset, wr.length)?;
                bytes.extend_from_slice(&payload);
            } else {
                let (k, extra, _middle) = long_split(local.base() + wr.local_offset, wr.length);
                if k > 0 {
                    let head = local.read_bytes(wr.local_offset, k)?;
                    bytes.extend_from_slice(&head);
                }
                if extra > 0 {
                    let tail = local.read_bytes(wr.local_offset + wr.length - extra, extra)?;
                    bytes.extend_from_slice(&tail);
                }
            }
        }

        Ok(CmdMsg { bytes })
    }

    /// Wrap slot bytes arriving off the wire.
    pub fn from_bytes(bytes: Vec<u8>) -> NntiResult<CmdMsg> {
        if bytes.len() < HEADER_LEN {
            return Err(NntiError::Decode);
        }
        Ok(CmdMsg { bytes })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn u64_at(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.bytes[off..off + 8].try_into().unwrap())
    }

    fn u32_at(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.bytes[off..off + 4].try_into().unwrap())
    }

    pub fn initiator_pid(&self) -> u64 {
        self.u64_at(0)
    }

    pub fn initiator_offset(&self) -> u64 {
        self.u64_at(8)
    }

    pub fn target_offset(&self) -> u64 {
        self.u64_at(16)
    }

    pub fn payload_length(&self) -> u64 {
        self.u64_at(24)
    }

    pub fn target_base_addr(&self) -> u64 {
        self.u64_at(32)
    }

    pub fn op_id(&self) -> u32 {
        self.u32_at(40)
    }

    pub fn src_op_id(&self) -> u32 {
        self.u32_at(44)
    }

    pub fn set_src_op_id(&mut self, id: u32) {
        self.bytes[44..48].copy_from_slice(&id.to_le_bytes());
    }

    /// An arriving message with no target base is unexpected.
    pub fn unexpected(&self) -> bool {
        self.target_base_addr() == 0
    }

    /// Eager iff the full payload traveled inline.
    pub fn eager(&self) -> bool {
        self.bytes.len() as u64 >= HEADER_LEN as u64 + self.payload_length()
    }

    pub fn eager_payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    /// The initiator's packed buffer descriptor, when one was attached.
    pub fn initiator_handle(&self) -> NntiResult<Option<PackedBuffer>> {
        let region = &self.bytes[HEADER_FIXED..HEADER_FIXED + PACKED_BUFFER_MAX];
        let tag = u32::from_le_bytes(region[0..4].try_into().unwrap());
        if tag == 0 {
            return Ok(None);
        }
        PackedBuffer::unpack(region).map(Some)
    }

    /// Reconstruct a usable buffer handle for the initiator region, deduping
    /// against a local lookup (loopback sends resolve to the registered
    /// buffer itself).
    pub fn initiator_buffer(
        &self,
        lookup_local: impl Fn(u64) -> Option<std::sync::Arc<Buffer>>,
    ) -> NntiResult<Option<std::sync::Arc<Buffer>>> {
        match self.initiator_handle()? {
            None => Ok(None),
            Some(PackedBuffer::Sockets { buf, size }) => {
                if let Some(local) = lookup_local(buf) {
                    Ok(Some(local))
                } else {
                    Ok(Some(Buffer::remote_descriptor(buf, size)))
                }
            }
            Some(_) => Err(NntiError::Decode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{buffer_flags as bf, CMD_MSG_SIZE_DEFAULT};
    use std::sync::Arc;

    fn flags() -> u32 {
        bf::LOCAL_READ | bf::LOCAL_WRITE | bf::REMOTE_READ | bf::REMOTE_WRITE
    }

    fn wr_for(local: &Arc<Buffer>, offset: u64, length: u64) -> WorkRequest {
        WorkRequest {
            op: crate::types::OpKind::Send,
            local_hdl: Some(local.clone()),
            local_offset: offset,
            length,
            ..Default::default()
        }
    }

    #[test]
    fn test_header_fields_round_trip() {
        let local = Buffer::alloc(4096, flags(), None, None, 0).unwrap();
        local.copy_in(0, b"abcdefgh").unwrap();
        let mut wr = wr_for(&local, 0, 8);
        wr.remote_offset = 16;

        let mut m = CmdMsg::pack(7, 0, &wr, 0xfeed, CMD_MSG_SIZE_DEFAULT).unwrap();
        m.set_src_op_id(21);

        assert_eq!(m.initiator_pid(), 0xfeed);
        assert_eq!(m.initiator_offset(), 0);
        assert_eq!(m.target_offset(), 16);
        assert_eq!(m.payload_length(), 8);
        assert_eq!(m.op_id(), 7);
        assert_eq!(m.src_op_id(), 21);
        assert!(m.unexpected(), "no remote handle means unexpected");
        assert!(m.eager());
        assert_eq!(&m.eager_payload()[..8], b"abcdefgh");
    }

    #[test]
    fn test_eager_boundary() {
        let cap = CmdMsg::eager_capacity(CMD_MSG_SIZE_DEFAULT);
        let local = Buffer::alloc(cap + 64, flags(), None, None, 0).unwrap();

        let m = CmdMsg::pack(1, 0, &wr_for(&local, 0, cap), 1, CMD_MSG_SIZE_DEFAULT).unwrap();
        assert!(m.eager(), "payload exactly at capacity stays eager");

        let m = CmdMsg::pack(1, 0, &wr_for(&local, 0, cap + 1), 1, CMD_MSG_SIZE_DEFAULT).unwrap();
        assert!(!m.eager(), "one byte past capacity goes rendezvous");
    }

    #[test]
    fn test_long_split_math() {
        // aligned address, aligned length
        assert_eq!(long_split(0x1000, 996), (0, 0, 996));
        // misaligned by 3 (addr % 4 == 1), length 1000: 3 head + 1 tail
        assert_eq!(long_split(0x1001, 1000), (3, 1, 996));
        // misaligned by 2
        assert_eq!(long_split(0x1002, 1000), (2, 2, 996));
    }

    #[test]
    fn test_long_message_carries_padding_inline() {
        let cap = CmdMsg::eager_capacity(CMD_MSG_SIZE_DEFAULT);
        let n = cap + 200;
        let local = Buffer::alloc(n + 16, flags(), None, None, 0).unwrap();
        let pattern: Vec<u8> = (0..n + 16).map(|i| (i % 251) as u8).collect();
        local.copy_in(0, &pattern).unwrap();

        // offset 1 off an 8-byte-aligned base: k = 3
        let m = CmdMsg::pack(1, 0, &wr_for(&local, 1, n), 1, CMD_MSG_SIZE_DEFAULT).unwrap();
        assert!(!m.eager());

        let (k, extra, middle) = long_split(local.base() + 1, n);
        assert_eq!(k, 3);
        assert_eq!(middle % RDMA_ALIGNMENT, 0);
        assert_eq!(m.eager_payload().len() as u64, k + extra);
        // head bytes are source[1..1+k]
        assert_eq!(&m.eager_payload()[..k as usize], &pattern[1..1 + k as usize]);
        // tail bytes are the last `extra` of the payload
        let tail_src = &pattern[(1 + n - extra) as usize..(1 + n) as usize];
        assert_eq!(&m.eager_payload()[k as usize..], tail_src);
    }

    #[test]
    fn test_initiator_buffer_dedup() {
        let local = Buffer::alloc(64, flags(), None, None, 0).unwrap();
        local.copy_in(0, b"x").unwrap();
        let m = CmdMsg::pack(1, 0, &wr_for(&local, 0, 1), 1, CMD_MSG_SIZE_DEFAULT).unwrap();

        // lookup hit: the registered buffer comes back
        let l2 = local.clone();
        let got = m
            .initiator_buffer(|base| if base == l2.base() { Some(l2.clone()) } else { None })
            .unwrap()
            .unwrap();
        assert!(!got.is_remote());
        assert_eq!(got.base(), local.base());

        // lookup miss: a remote descriptor
        let got = m.initiator_buffer(|_| None).unwrap().unwrap();
        assert!(got.is_remote());
        assert_eq!(got.base(), local.base());
        assert_eq!(got.length(), local.length());
    }
}
