//! Target-side command op.
//!
//! Every arriving command message gets one of these. Expected messages land
//! in the registered target buffer (inline copy for eager, rendezvous get
//! for long); unexpected messages are staged on the transport until the
//! application retrieves them with `next_unexpected`.
//!
//! The per-op mutex is released around the unexpected-queue callback, which
//! is allowed to call `next_unexpected` on this very message. That re-entry
//! advances the state machine underneath the callback's frame; on return the
//! outer frame notices the state has moved past the retrieval handoff and
//! backs out instead of repeating it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nexus_common::{nlog_debug, nlog_warn};

use crate::buffer::Buffer;
use crate::error::{NntiError, NntiResult};
use crate::sockets::cmd_msg::{long_split, CmdMsg};
use crate::sockets::conn::Connection;
use crate::sockets::wire::{build_long_get_ack, tags};
use crate::sockets::SocketsTransport;
use crate::stats::TransportStats;
use crate::types::{event_types, Event, OpKind, TransportId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CmdTgtState {
    Init,
    Unpack,
    PushUnexpectedMsg,
    CreateUnexpectedEvent,
    InvokeUnexpectedQueueCallback,
    InvokingUnexpectedQueueCallback,
    PushUnexpectedEvent,
    NeedUnexpectedRetrieval,
    WaitUnexpectedRetrieval,
    UnexpectedCopyIn,
    UnexpectedLongGet,
    UnexpectedLongGetComplete,
    Expected,
    Eager,
    EagerCopyIn,
    IssueEagerEvent,
    Long,
    LongGet,
    WaitLongGet,
    LongGetComplete,
    SendLongGetAck,
    SendLongGetAckComplete,
    IssueLongEvent,
    Cleanup,
    Done,
}

struct CmdTgtInner {
    state: CmdTgtState,
    msg: CmdMsg,
    initiator_hdl: Option<Arc<Buffer>>,
    target_hdl: Option<Arc<Buffer>>,
    unexpected: bool,
    event: Option<Event>,
    unexpected_dst: Option<(Arc<Buffer>, u64)>,
    actual_offset: u64,
    /// head pad of the in-flight rendezvous get
    long_k: u64,
    /// aligned middle length of the in-flight rendezvous get
    long_middle: u64,
    failed: Option<NntiError>,
}

pub struct CmdTgt {
    index: AtomicU32,
    conn: Mutex<Arc<Connection>>,
    inner: Mutex<CmdTgtInner>,
}

impl CmdTgt {
    pub fn new(conn: Arc<Connection>, msg: CmdMsg) -> Arc<CmdTgt> {
        Arc::new(CmdTgt {
            index: AtomicU32::new(u32::MAX),
            conn: Mutex::new(conn),
            inner: Mutex::new(Self::fresh_inner(msg)),
        })
    }

    fn fresh_inner(msg: CmdMsg) -> CmdTgtInner {
        let unexpected = msg.unexpected();
        CmdTgtInner {
            state: CmdTgtState::Init,
            msg,
            initiator_hdl: None,
            target_hdl: None,
            unexpected,
            event: None,
            unexpected_dst: None,
            actual_offset: 0,
            long_k: 0,
            long_middle: 0,
            failed: None,
        }
    }

    /// Rearm a recycled op for a fresh message.
    pub fn reset(&mut self, conn: Arc<Connection>, msg: CmdMsg) {
        self.index = AtomicU32::new(u32::MAX);
        *self.conn.get_mut().unwrap() = conn;
        *self.inner.get_mut().unwrap() = Self::fresh_inner(msg);
    }

    pub fn index(&self) -> u32 {
        self.index.load(Ordering::Acquire)
    }

    pub fn set_index(&self, index: u32) {
        self.index.store(index, Ordering::Release);
    }

    fn conn(&self) -> Arc<Connection> {
        self.conn.lock().unwrap().clone()
    }

    pub fn initiator_pid(&self) -> u64 {
        self.inner.lock().unwrap().msg.initiator_pid()
    }

    pub fn payload_length(&self) -> u64 {
        self.inner.lock().unwrap().msg.payload_length()
    }

    /// Retrieval handoff: where the application wants the payload.
    pub fn set_unexpected_dst(&self, dst: Arc<Buffer>, offset: u64) {
        self.inner.lock().unwrap().unexpected_dst = Some((dst, offset));
    }

    /// Where the payload actually landed (QUEUING buffers relocate it).
    pub fn actual_offset(&self) -> u64 {
        self.inner.lock().unwrap().actual_offset
    }

    pub fn failed(&self) -> Option<NntiError> {
        self.inner.lock().unwrap().failed
    }

    /// The rendezvous data for an expected long message arrived; land it and
    /// resume the machine.
    pub fn complete_long_get(self: &Arc<Self>, t: &SocketsTransport, code: Option<NntiError>, data: &[u8]) -> bool {
        {
            let mut g = self.inner.lock().unwrap();
            if let Some(e) = code {
                g.failed = Some(e);
            } else {
                let dst = g.target_hdl.clone();
                let off = g.msg.target_offset() + g.long_k;
                if let Some(dst) = dst {
                    if let Err(e) = dst.copy_in(off, data) {
                        g.failed = Some(e);
                    }
                }
            }
        }
        self.update(t, &Event::noop())
    }

    pub fn update(self: &Arc<Self>, t: &SocketsTransport, _ev: &Event) -> bool {
        let mut g = self.inner.lock().unwrap();
        loop {
            nlog_debug!("nnti", "cmd_tgt {} state {:?}", self.index(), g.state);
            match g.state {
                CmdTgtState::Init => {
                    g.state = CmdTgtState::Unpack;
                }
                CmdTgtState::Unpack => {
                    match self.unpack(t, &mut g) {
                        Err(e) => {
                            nlog_warn!("nnti", "command message unpack failed: {}", e);
                            g.failed = Some(e);
                            g.state = CmdTgtState::Cleanup;
                        }
                        Ok(()) => {
                            g.state = if g.unexpected {
                                CmdTgtState::PushUnexpectedMsg
                            } else {
                                CmdTgtState::Expected
                            };
                        }
                    }
                }
                CmdTgtState::PushUnexpectedMsg => {
                    if t.unexpected_queue().is_none() {
                        // nobody can ever retrieve this message
                        TransportStats::bump(&t.stats().dropped_unexpected);
                        g.state = CmdTgtState::Cleanup;
                    } else {
                        t.enqueue_unexpected(self.clone());
                        TransportStats::bump(&t.stats().unexpected_recvs);
                        g.state = CmdTgtState::CreateUnexpectedEvent;
                    }
                }
                CmdTgtState::CreateUnexpectedEvent => {
                    let ev = self.create_event(t, &g, 0, true);
                    g.event = Some(ev);
                    g.state = CmdTgtState::InvokeUnexpectedQueueCallback;
                }
                CmdTgtState::InvokeUnexpectedQueueCallback => {
                    g.state = CmdTgtState::InvokingUnexpectedQueueCallback;
                    let ev = g.event.unwrap_or_else(Event::noop);
                    let q = t.unexpected_queue();
                    // The callback may call next_unexpected on this very
                    // message; the lock must be free at re-entry.
                    drop(g);
                    let consumed = q.as_ref().map(|q| q.invoke_cb(&ev)).unwrap_or(false);
                    g = self.inner.lock().unwrap();
                    if !consumed {
                        g.state = CmdTgtState::PushUnexpectedEvent;
                    } else if g.state > CmdTgtState::NeedUnexpectedRetrieval {
                        // the callback already retrieved this message; the
                        // re-entrant frame owns the rest of the lifecycle
                        return false;
                    } else {
                        g.state = CmdTgtState::NeedUnexpectedRetrieval;
                    }
                }
                CmdTgtState::InvokingUnexpectedQueueCallback => {
                    // re-entered from inside the callback via next_unexpected
                    g.state = CmdTgtState::WaitUnexpectedRetrieval;
                }
                CmdTgtState::PushUnexpectedEvent => {
                    if let (Some(q), Some(ev)) = (t.unexpected_queue(), g.event) {
                        if q.push(ev) {
                            q.notify();
                        } else {
                            TransportStats::bump(&t.stats().dropped_events);
                        }
                    }
                    g.state = CmdTgtState::NeedUnexpectedRetrieval;
                }
                CmdTgtState::NeedUnexpectedRetrieval => {
                    g.state = CmdTgtState::WaitUnexpectedRetrieval;
                    return false;
                }
                CmdTgtState::WaitUnexpectedRetrieval => {
                    g.state = if g.msg.eager() {
                        CmdTgtState::UnexpectedCopyIn
                    } else {
                        CmdTgtState::UnexpectedLongGet
                    };
                }
                CmdTgtState::UnexpectedCopyIn => {
                    match Self::unexpected_copy_in(&mut g) {
                        Ok(()) => TransportStats::bump(&t.stats().short_recvs),
                        Err(e) => g.failed = Some(e),
                    }
                    g.state = CmdTgtState::Cleanup;
                }
                CmdTgtState::UnexpectedLongGet => {
                    match self.unexpected_long_get(t, &mut g) {
                        Ok(()) => {
                            TransportStats::bump(&t.stats().long_recvs);
                            g.state = CmdTgtState::UnexpectedLongGetComplete;
                        }
                        Err(e) => {
                            g.failed = Some(e);
                            g.state = CmdTgtState::Cleanup;
                        }
                    }
                }
                CmdTgtState::UnexpectedLongGetComplete => {
                    g.state = CmdTgtState::SendLongGetAck;
                }
                CmdTgtState::Expected => {
                    g.state = if g.msg.eager() {
                        CmdTgtState::Eager
                    } else {
                        CmdTgtState::Long
                    };
                }
                CmdTgtState::Eager => {
                    g.state = CmdTgtState::EagerCopyIn;
                }
                CmdTgtState::EagerCopyIn => {
                    match Self::eager_copy_in(&mut g) {
                        Ok(()) => {}
                        Err(e) => g.failed = Some(e),
                    }
                    g.state = CmdTgtState::IssueEagerEvent;
                }
                CmdTgtState::IssueEagerEvent => {
                    let ev = self.create_event(t, &g, g.actual_offset, false);
                    self.issue_target_event(t, &g, ev);
                    TransportStats::bump(&t.stats().short_recvs);
                    g.state = CmdTgtState::Cleanup;
                }
                CmdTgtState::Long => {
                    g.state = CmdTgtState::LongGet;
                }
                CmdTgtState::LongGet => {
                    match self.long_get(t, &mut g) {
                        Ok(()) => {
                            TransportStats::bump(&t.stats().long_recvs);
                            g.state = CmdTgtState::WaitLongGet;
                            return false;
                        }
                        Err(e) => {
                            g.failed = Some(e);
                            g.state = CmdTgtState::Cleanup;
                        }
                    }
                }
                CmdTgtState::WaitLongGet => {
                    g.state = CmdTgtState::LongGetComplete;
                }
                CmdTgtState::LongGetComplete => {
                    g.state = CmdTgtState::SendLongGetAck;
                }
                CmdTgtState::SendLongGetAck => {
                    let ack = build_long_get_ack(g.msg.src_op_id());
                    if let Err(e) = self.conn().send_frame(tags::LONG_GET_ACK, &ack) {
                        nlog_warn!("nnti", "long get ack send failed: {}", e);
                    }
                    g.state = CmdTgtState::SendLongGetAckComplete;
                }
                CmdTgtState::SendLongGetAckComplete => {
                    g.state = if g.unexpected {
                        CmdTgtState::Cleanup
                    } else {
                        CmdTgtState::IssueLongEvent
                    };
                }
                CmdTgtState::IssueLongEvent => {
                    let ev = self.create_event(t, &g, g.msg.target_offset(), false);
                    self.issue_target_event(t, &g, ev);
                    g.state = CmdTgtState::Cleanup;
                }
                CmdTgtState::Cleanup => {
                    g.event = None;
                    g.state = CmdTgtState::Done;
                }
                CmdTgtState::Done => {
                    return true;
                }
            }
        }
    }

    // -- state bodies --------------------------------------------------------

    fn unpack(&self, t: &SocketsTransport, g: &mut CmdTgtInner) -> NntiResult<()> {
        g.initiator_hdl = g.msg.initiator_buffer(|base| t.lookup_buffer(base))?;
        if !g.unexpected {
            let base = g.msg.target_base_addr();
            match t.lookup_buffer(base) {
                Some(b) => g.target_hdl = Some(b),
                None => {
                    nlog_warn!("nnti", "message targets unknown buffer {:#x}", base);
                    return Err(NntiError::Noent);
                }
            }
        }
        Ok(())
    }

    fn unexpected_copy_in(g: &mut CmdTgtInner) -> NntiResult<()> {
        let (dst, offset) = g.unexpected_dst.clone().ok_or(NntiError::Inval)?;
        let payload = &g.msg.eager_payload()[..g.msg.payload_length() as usize];
        g.actual_offset = dst.copy_in(offset, payload)?;
        Ok(())
    }

    fn eager_copy_in(g: &mut CmdTgtInner) -> NntiResult<()> {
        let dst = g.target_hdl.clone().ok_or(NntiError::Noent)?;
        let payload = &g.msg.eager_payload()[..g.msg.payload_length() as usize];
        g.actual_offset = dst.copy_in(g.msg.target_offset(), payload)?;
        Ok(())
    }

    /// Synchronous rendezvous get for a retrieved unexpected message:
    /// inline head/tail from the slot, aligned middle over the wire.
    fn unexpected_long_get(
        self: &Arc<Self>,
        t: &SocketsTransport,
        g: &mut CmdTgtInner,
    ) -> NntiResult<()> {
        let (dst, dst_off) = g.unexpected_dst.clone().ok_or(NntiError::Inval)?;
        let init = g.initiator_hdl.clone().ok_or(NntiError::Decode)?;
        let length = g.msg.payload_length();
        let init_off = g.msg.initiator_offset();

        let (k, extra, middle) = long_split(init.base() + init_off, length);
        let inline = g.msg.eager_payload();
        if k > 0 {
            dst.copy_in(dst_off, &inline[..k as usize])?;
        }
        if extra > 0 {
            dst.copy_in(dst_off + length - extra, &inline[k as usize..(k + extra) as usize])?;
        }

        t.blocking_long_get(
            &self.conn(),
            init.base(),
            init_off + k,
            middle,
            dst.clone(),
            dst_off + k,
        )?;
        TransportStats::add(&t.stats().long_get_bytes, middle);
        g.actual_offset = dst_off;
        Ok(())
    }

    /// Asynchronous rendezvous get for an expected long message; the
    /// progress thread resumes the machine when the data lands.
    fn long_get(self: &Arc<Self>, t: &SocketsTransport, g: &mut CmdTgtInner) -> NntiResult<()> {
        let dst = g.target_hdl.clone().ok_or(NntiError::Noent)?;
        let init = g.initiator_hdl.clone().ok_or(NntiError::Decode)?;
        let length = g.msg.payload_length();
        let init_off = g.msg.initiator_offset();
        let tgt_off = g.msg.target_offset();

        let (k, extra, middle) = long_split(init.base() + init_off, length);
        let inline = g.msg.eager_payload();
        if k > 0 {
            dst.copy_in(tgt_off, &inline[..k as usize])?;
        }
        if extra > 0 {
            dst.copy_in(tgt_off + length - extra, &inline[k as usize..(k + extra) as usize])?;
        }
        g.long_k = k;
        g.long_middle = middle;
        g.actual_offset = tgt_off;

        t.post_op_get(&self.conn(), self.index(), init.base(), init_off + k, middle)?;
        TransportStats::add(&t.stats().long_get_bytes, middle);
        Ok(())
    }

    fn create_event(
        &self,
        t: &SocketsTransport,
        g: &CmdTgtInner,
        offset: u64,
        unexpected: bool,
    ) -> Event {
        let mut ev = t.take_event();
        ev.transport = TransportId::Sockets;
        ev.result = Ok(());
        ev.op = OpKind::Send;
        ev.wid = 0;
        ev.peer_pid = g.msg.initiator_pid();
        ev.length = g.msg.payload_length();
        ev.context = 0;
        if unexpected {
            ev.event_type = event_types::UNEXPECTED;
            ev.start = 0;
            ev.offset = 0;
        } else {
            ev.event_type = event_types::RECV;
            ev.start = g.target_hdl.as_ref().map(|b| b.base()).unwrap_or(0);
            ev.offset = offset;
        }
        ev
    }

    fn issue_target_event(&self, t: &SocketsTransport, g: &CmdTgtInner, ev: Event) {
        let buf = match &g.target_hdl {
            Some(b) => b.clone(),
            None => {
                t.recycle_event(ev);
                return;
            }
        };
        t.deliver_target_event(&buf, ev);
    }
}
