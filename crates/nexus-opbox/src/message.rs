//! Dispatcher messages.
//!
//! Every message names the op class it belongs to (`op_id`), the mailbox of
//! the op it targets (`dst_mailbox`, zero for "start a new target op"), and
//! the sender's mailbox and node so replies can find their way back.

use nexus_common::nodeid::NodeId;

use nexus_nnti::error::{NntiError, NntiResult};

pub const MSG_HEADER_LEN: usize = 24;

/// The mailbox value that means "no op yet: create one".
pub const MAILBOX_UNSPECIFIED: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub op_id: u32,
    pub dst_mailbox: u32,
    pub src_mailbox: u32,
    pub src_node: NodeId,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(op_id: u32, dst_mailbox: u32, src_mailbox: u32, src_node: NodeId) -> Message {
        Message { op_id, dst_mailbox, src_mailbox, src_node, body: Vec::new() }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Message {
        self.body = body;
        self
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MSG_HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.op_id.to_le_bytes());
        out.extend_from_slice(&self.dst_mailbox.to_le_bytes());
        out.extend_from_slice(&self.src_mailbox.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&self.src_node.raw().to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn unpack(raw: &[u8]) -> NntiResult<Message> {
        if raw.len() < MSG_HEADER_LEN {
            return Err(NntiError::Decode);
        }
        let u32_at = |o: usize| u32::from_le_bytes(raw[o..o + 4].try_into().unwrap());
        Ok(Message {
            op_id: u32_at(0),
            dst_mailbox: u32_at(4),
            src_mailbox: u32_at(8),
            src_node: NodeId::from_raw(u64::from_le_bytes(raw[16..24].try_into().unwrap())),
            body: raw[MSG_HEADER_LEN..].to_vec(),
        })
    }
}
