//! User-defined ops.
//!
//! An op is a little state machine the dispatcher drives: launched locally
//! with a start update, then fed one update per arriving message or user
//! trigger. All updates for one mailbox run serially, in arrival order, so
//! an op never needs its own locking for its internal state.

use std::sync::Arc;

use crate::core::OpBoxCore;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    /// The op was just launched locally.
    Start,
    /// A message arrived for this op's mailbox.
    Incoming,
    /// The application poked the op directly.
    UserTrigger,
}

/// What an op wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitingType {
    /// Finished; the dispatcher removes and drops the op.
    DoneAndDestroy,
    WaitingOnMessage,
    WaitingOnTimer,
    /// Unrecoverable; the dispatcher aborts the process.
    Error,
}

pub struct IncomingMessage {
    pub peer_pid: u64,
    pub msg: Message,
}

pub struct OpArgs {
    pub update_type: UpdateType,
    pub incoming: Option<IncomingMessage>,
    /// The dispatcher driving this update; ops send through it.
    pub core: Arc<OpBoxCore>,
    /// The mailbox this op lives in; replies quote it as src_mailbox.
    pub mailbox: u32,
    pub result: i32,
}

impl OpArgs {
    pub fn start(core: Arc<OpBoxCore>) -> OpArgs {
        OpArgs { update_type: UpdateType::Start, incoming: None, core, mailbox: 0, result: 0 }
    }

    pub fn incoming(core: Arc<OpBoxCore>, peer_pid: u64, msg: Message) -> OpArgs {
        OpArgs {
            update_type: UpdateType::Incoming,
            incoming: Some(IncomingMessage { peer_pid, msg }),
            core,
            mailbox: 0,
            result: 0,
        }
    }

    pub fn trigger(core: Arc<OpBoxCore>) -> OpArgs {
        OpArgs { update_type: UpdateType::UserTrigger, incoming: None, core, mailbox: 0, result: 0 }
    }
}

/// A user state machine multiplexed onto the transport.
///
/// `op_id` is the 32-bit FNV-1a of the op's name, computed at compile time
/// (`const ID: u32 = fnv1a_32(b"OpThing")`), so both sides of the wire agree
/// on which factory builds the target side.
pub trait Op: Send {
    fn op_id(&self) -> u32;
    fn op_name(&self) -> &'static str;
    fn update(&mut self, args: &mut OpArgs) -> WaitingType;
    fn state_name(&self) -> String {
        "active".to_string()
    }
}
