//! Work requests.
//!
//! A work request is a caller-owned description of one operation. The
//! transport copies it into the work id at submit time; the caller's struct
//! only has to stay alive across the submitting call.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::eq::EventQueue;
use crate::peer::Peer;
use crate::types::{Event, OpKind};

/// Completion callback. Returning `true` consumes the event; `false` lets
/// delivery fall through to the next stage (alternate queue, buffer queue).
pub type EventCallback = Arc<dyn Fn(&Event, u64) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct WorkRequest {
    pub op: OpKind,
    pub flags: u32,
    pub peer: Option<Arc<Peer>>,
    pub local_hdl: Option<Arc<Buffer>>,
    pub local_offset: u64,
    pub remote_hdl: Option<Arc<Buffer>>,
    pub remote_offset: u64,
    pub length: u64,
    /// Add operand (fetch-add) or compare operand (compare-swap).
    pub operand1: i64,
    /// Swap operand (compare-swap only).
    pub operand2: i64,
    /// Deliver events here instead of the local buffer's queue.
    pub alt_eq: Option<Arc<EventQueue>>,
    pub callback: Option<EventCallback>,
    pub cb_context: u64,
    /// Opaque user data copied into every event this request generates.
    pub event_context: u64,
}

impl WorkRequest {
    /// Run the request-level callback; false when absent or not consumed.
    pub fn invoke_cb(&self, ev: &Event) -> bool {
        match &self.callback {
            Some(cb) => cb(ev, self.cb_context),
            None => false,
        }
    }

    pub fn peer_pid(&self) -> u64 {
        self.peer.as_ref().map(|p| p.pid()).unwrap_or(0)
    }
}

impl std::fmt::Debug for WorkRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRequest")
            .field("op", &self.op)
            .field("flags", &self.flags)
            .field("peer_pid", &self.peer_pid())
            .field("local_offset", &self.local_offset)
            .field("remote_offset", &self.remote_offset)
            .field("length", &self.length)
            .finish()
    }
}
