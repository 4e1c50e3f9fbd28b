//! Initiator-side command op.
//!
//! One state machine per submitted send. Transitions that hand a frame to
//! the fabric return to the caller; the next `update` comes from the
//! progress thread (credit arrival, rendezvous ack). On this fabric a
//! successful frame write is the send completion, so eager sends run
//! through to the event in the submitting call.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nexus_common::nlog_debug;

use crate::error::{EventResult, NntiError, NntiResult};
use crate::sockets::cmd_msg::CmdMsg;
use crate::sockets::wire::tags;
use crate::sockets::SocketsTransport;
use crate::types::{event_types, Event, TransportId};
use crate::wid::WorkId;

/// `update` return: op parked waiting for a fabric event.
pub const UPDATE_PARKED: u8 = 0;
/// `update` return: op ran to completion; retire it.
pub const UPDATE_DONE: u8 = 1;
/// `update` return: op is out of send credits; waitlist it.
pub const UPDATE_WAITLISTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdOpState {
    Init,
    ExecuteSend,
    NeedSendCredits,
    WaitSendCredits,
    NeedSendComplete,
    WaitSendComplete,
    WaitRdmaAck,
    IssueSendEvent,
    Cleanup,
    Done,
}

struct CmdOpInner {
    state: CmdOpState,
    wid: Option<Arc<WorkId>>,
    msg: Option<CmdMsg>,
    eager: bool,
    result: EventResult,
}

pub struct CmdOp {
    index: AtomicU32,
    inner: Mutex<CmdOpInner>,
}

impl CmdOp {
    pub fn new(wid: Arc<WorkId>, msg: CmdMsg) -> Arc<CmdOp> {
        let eager = msg.eager();
        Arc::new(CmdOp {
            index: AtomicU32::new(u32::MAX),
            inner: Mutex::new(CmdOpInner {
                state: CmdOpState::Init,
                wid: Some(wid),
                msg: Some(msg),
                eager,
                result: Ok(()),
            }),
        })
    }

    /// Rearm a recycled op for a fresh request.
    pub fn reset(&mut self, wid: Arc<WorkId>, msg: CmdMsg) {
        self.index = AtomicU32::new(u32::MAX);
        let inner = self.inner.get_mut().unwrap();
        inner.state = CmdOpState::Init;
        inner.eager = msg.eager();
        inner.wid = Some(wid);
        inner.msg = Some(msg);
        inner.result = Ok(());
    }

    pub fn index(&self) -> u32 {
        self.index.load(Ordering::Acquire)
    }

    pub fn set_index(&self, index: u32) {
        self.index.store(index, Ordering::Release);
    }

    pub fn wid(&self) -> Option<Arc<WorkId>> {
        self.inner.lock().unwrap().wid.clone()
    }

    pub fn is_eager(&self) -> bool {
        self.inner.lock().unwrap().eager
    }

    /// Park a fresh op straight onto the credit path. Used when older sends
    /// are already waitlisted, so per-connection order holds.
    pub fn park_for_credits(&self) {
        self.inner.lock().unwrap().state = CmdOpState::WaitSendCredits;
    }

    /// Stamp the op-vector index into the message for ack correlation.
    pub fn set_src_op_id(&self, id: u32) {
        let mut g = self.inner.lock().unwrap();
        if let Some(m) = g.msg.as_mut() {
            m.set_src_op_id(id);
        }
    }

    pub fn update(&self, t: &SocketsTransport, _ev: &Event) -> u8 {
        let mut g = self.inner.lock().unwrap();
        loop {
            nlog_debug!("nnti", "cmd_op {} state {:?}", self.index(), g.state);
            match g.state {
                CmdOpState::Init => {
                    g.state = CmdOpState::ExecuteSend;
                }
                CmdOpState::ExecuteSend => match Self::execute_send(t, &g) {
                    Ok(true) => g.state = CmdOpState::NeedSendComplete,
                    Ok(false) => g.state = CmdOpState::NeedSendCredits,
                    Err(e) => {
                        g.result = Err(e);
                        g.state = CmdOpState::IssueSendEvent;
                    }
                },
                CmdOpState::NeedSendCredits => {
                    g.state = CmdOpState::WaitSendCredits;
                    return UPDATE_WAITLISTED;
                }
                CmdOpState::WaitSendCredits => {
                    g.state = CmdOpState::ExecuteSend;
                }
                CmdOpState::NeedSendComplete => {
                    g.state = CmdOpState::WaitSendComplete;
                }
                CmdOpState::WaitSendComplete => {
                    // frame write was the send completion on this fabric
                    if !g.eager {
                        g.state = CmdOpState::WaitRdmaAck;
                        return UPDATE_PARKED;
                    }
                    g.state = CmdOpState::IssueSendEvent;
                }
                CmdOpState::WaitRdmaAck => {
                    // the rendezvous ack arrived
                    g.state = CmdOpState::IssueSendEvent;
                }
                CmdOpState::IssueSendEvent => {
                    self.issue_send_event(t, &g);
                    g.state = CmdOpState::Cleanup;
                }
                CmdOpState::Cleanup => {
                    self.update_stats(t, &g);
                    if let Some(wid) = &g.wid {
                        wid.mark_complete();
                    }
                    g.state = CmdOpState::Done;
                }
                CmdOpState::Done => {
                    return UPDATE_DONE;
                }
            }
        }
    }

    /// Push the command frame. Ok(false) means no send credit was available.
    fn execute_send(t: &SocketsTransport, g: &CmdOpInner) -> NntiResult<bool> {
        let wid = g.wid.as_ref().ok_or(NntiError::Inval)?;
        let peer = wid.wr().peer.clone().ok_or(NntiError::Inval)?;
        let conn = t.connection_for_peer(&peer)?;
        if !conn.take_credit() {
            return Ok(false);
        }
        let msg = g.msg.as_ref().ok_or(NntiError::Inval)?;
        match conn.send_frame(tags::REQUEST, msg.bytes()) {
            Ok(()) => Ok(true),
            Err(e) => {
                conn.add_credits(1);
                Err(e)
            }
        }
    }

    fn issue_send_event(&self, t: &SocketsTransport, g: &CmdOpInner) {
        let wid = match &g.wid {
            Some(w) => w,
            None => return,
        };
        let wr = wid.wr();
        let mut ev = t.take_event();
        ev.transport = TransportId::Sockets;
        ev.event_type = event_types::SEND;
        ev.result = g.result;
        ev.wid = wid.id();
        ev.op = wr.op;
        ev.peer_pid = wr.peer_pid();
        ev.start = wr.local_hdl.as_ref().map(|b| b.base()).unwrap_or(0);
        ev.offset = wr.local_offset;
        ev.length = wr.length;
        ev.context = wr.event_context;
        t.deliver_initiator_event(wr, ev);
    }

    fn update_stats(&self, t: &SocketsTransport, g: &CmdOpInner) {
        use crate::stats::TransportStats;
        let s = t.stats();
        if g.eager {
            TransportStats::bump(&s.short_sends);
        } else {
            TransportStats::bump(&s.long_sends);
        }
        if let Some(wid) = &g.wid {
            if wid.wr().remote_hdl.is_none() {
                TransportStats::bump(&s.unexpected_sends);
            }
        }
    }
}
