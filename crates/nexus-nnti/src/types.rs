//! Core transport types: ids, operation kinds, flag sets, attributes and
//! the completion event.

use crate::error::EventResult;

/// Default size of one command slot in a connection's mailbox ring.
pub const CMD_MSG_SIZE_DEFAULT: u32 = 2048;
/// Default number of slots (send credits) per connection.
pub const CMD_MSG_COUNT_DEFAULT: u32 = 64;
/// Ceiling for a packed buffer descriptor inside a command slot.
pub const PACKED_BUFFER_MAX: usize = 164;
/// Rendezvous get addresses and lengths must be multiples of this.
pub const RDMA_ALIGNMENT: u64 = 4;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportId {
    Null = 0,
    Ibverbs = 1,
    Ugni = 2,
    Mpi = 3,
    Sockets = 4,
}

impl TransportId {
    pub fn from_u32(v: u32) -> Option<TransportId> {
        match v {
            0 => Some(TransportId::Null),
            1 => Some(TransportId::Ibverbs),
            2 => Some(TransportId::Ugni),
            3 => Some(TransportId::Mpi),
            4 => Some(TransportId::Sockets),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpKind {
    #[default]
    Noop,
    Send,
    Put,
    Get,
    AtomicFadd,
    AtomicCswap,
}

/// Work-request behavior flags.
pub mod op_flags {
    pub const LOCAL_EVENT: u32 = 1;
    pub const REMOTE_EVENT: u32 = 2;
    pub const NO_ACK: u32 = 4;
    pub const USE_WAIT: u32 = 8;
    pub const ZERO_COPY: u32 = 16;
}

/// Event-queue creation flags.
pub mod eq_flags {
    /// This queue receives arriving messages that have no target buffer.
    pub const UNEXPECTED: u32 = 1;
    pub const LOCKLESS: u32 = 2;
}

/// Event type bitmask values.
pub mod event_types {
    pub const NOOP: u32 = 1;
    pub const SEND: u32 = 2;
    pub const PUT: u32 = 4;
    pub const GET: u32 = 8;
    pub const ATOMIC: u32 = 16;
    pub const OVERFLOW: u32 = 32;
    pub const UNEXPECTED: u32 = 64;
    pub const ACK: u32 = 128;
    pub const RECV: u32 = 256;
}

/// Registered-buffer permission flags.
pub mod buffer_flags {
    pub const LOCAL_READ: u32 = 1;
    pub const REMOTE_READ: u32 = 2;
    pub const LOCAL_WRITE: u32 = 4;
    pub const REMOTE_WRITE: u32 = 8;
    /// Arriving sends land at the offset+length of the previous send.
    pub const QUEUING: u32 = 16;
    pub const LOCAL_ATOMIC: u32 = 32;
    pub const REMOTE_ATOMIC: u32 = 64;
}

/// Runtime attributes of a started transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportAttrs {
    pub mtu: u32,
    pub max_cmd_header_size: u32,
    pub max_eager_size: u32,
    pub cmd_queue_size: u32,
}

/// A completion record.
///
/// `start` is the base address of the local buffer the operation touched
/// (zero when there is none, e.g. unexpected arrivals before retrieval).
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub transport: TransportId,
    pub event_type: u32,
    pub result: EventResult,
    pub wid: u32,
    pub op: OpKind,
    pub peer_pid: u64,
    pub start: u64,
    pub offset: u64,
    pub length: u64,
    pub context: u64,
}

impl Event {
    pub fn noop() -> Event {
        Event {
            transport: TransportId::Sockets,
            event_type: event_types::NOOP,
            result: Ok(()),
            wid: 0,
            op: OpKind::Noop,
            peer_pid: 0,
            start: 0,
            offset: 0,
            length: 0,
            context: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_id_round_trip() {
        for id in [
            TransportId::Null,
            TransportId::Ibverbs,
            TransportId::Ugni,
            TransportId::Mpi,
            TransportId::Sockets,
        ] {
            assert_eq!(TransportId::from_u32(id as u32), Some(id));
        }
        assert_eq!(TransportId::from_u32(99), None);
    }

    #[test]
    fn test_event_type_bits_are_disjoint() {
        let all = [
            event_types::NOOP,
            event_types::SEND,
            event_types::PUT,
            event_types::GET,
            event_types::ATOMIC,
            event_types::OVERFLOW,
            event_types::UNEXPECTED,
            event_types::ACK,
            event_types::RECV,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                if i != j {
                    assert_eq!(a & b, 0);
                }
            }
        }
    }
}
