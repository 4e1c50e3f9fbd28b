//! One-sided put/get ops at the initiator.
//!
//! The remote progress thread services the request against its registered
//! buffers; this op parks until the response (put ack / get data) comes
//! back, then delivers the local completion event. A put flagged NO_ACK
//! completes as soon as the frame is on the wire.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{EventResult, NntiError, NntiResult};
use crate::sockets::wire::{self, req_flags, tags};
use crate::sockets::SocketsTransport;
use crate::stats::TransportStats;
use crate::types::{event_types, op_flags, Event, OpKind, TransportId};
use crate::wid::WorkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaKind {
    Put,
    Get,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RdmaState {
    Init,
    Execute,
    WaitRemote,
    IssueEvent,
    Cleanup,
    Done,
}

struct RdmaInner {
    state: RdmaState,
    kind: RdmaKind,
    wid: Option<Arc<WorkId>>,
    result: EventResult,
}

pub struct RdmaOp {
    index: AtomicU32,
    inner: Mutex<RdmaInner>,
}

impl RdmaOp {
    pub fn new(kind: RdmaKind, wid: Arc<WorkId>) -> Arc<RdmaOp> {
        Arc::new(RdmaOp {
            index: AtomicU32::new(u32::MAX),
            inner: Mutex::new(RdmaInner {
                state: RdmaState::Init,
                kind,
                wid: Some(wid),
                result: Ok(()),
            }),
        })
    }

    pub fn reset(&mut self, kind: RdmaKind, wid: Arc<WorkId>) {
        self.index = AtomicU32::new(u32::MAX);
        let inner = self.inner.get_mut().unwrap();
        inner.state = RdmaState::Init;
        inner.kind = kind;
        inner.wid = Some(wid);
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

    /// The get data arrived (or failed); land it and resume.
    pub fn complete_get(&self, t: &SocketsTransport, code: Option<NntiError>, data: &[u8]) -> bool {
        {
            let mut g = self.inner.lock().unwrap();
            match code {
                Some(e) => g.result = Err(e),
                None => {
                    if let Some(wid) = &g.wid {
                        let wr = wid.wr();
                        if let Some(local) = &wr.local_hdl {
                            if let Err(e) = local.copy_in(wr.local_offset, data) {
                                g.result = Err(e);
                            }
                        }
                    }
                }
            }
        }
        self.update(t, &Event::noop())
    }

    /// Put acknowledged by the remote side.
    pub fn complete_put(&self, t: &SocketsTransport, code: Option<NntiError>) -> bool {
        {
            let mut g = self.inner.lock().unwrap();
            if let Some(e) = code {
                g.result = Err(e);
            }
        }
        self.update(t, &Event::noop())
    }

    /// Returns true when the op finished and should be retired.
    pub fn update(&self, t: &SocketsTransport, _ev: &Event) -> bool {
        let mut g = self.inner.lock().unwrap();
        loop {
            match g.state {
                RdmaState::Init => {
                    g.state = RdmaState::Execute;
                }
                RdmaState::Execute => match Self::execute(t, &g, self.index()) {
                    Ok(parked) => {
                        if parked {
                            g.state = RdmaState::WaitRemote;
                            return false;
                        }
                        g.state = RdmaState::IssueEvent;
                    }
                    Err(e) => {
                        g.result = Err(e);
                        g.state = RdmaState::IssueEvent;
                    }
                },
                RdmaState::WaitRemote => {
                    g.state = RdmaState::IssueEvent;
                }
                RdmaState::IssueEvent => {
                    self.issue_event(t, &g);
                    g.state = RdmaState::Cleanup;
                }
                RdmaState::Cleanup => {
                    let s = t.stats();
                    match g.kind {
                        RdmaKind::Put => TransportStats::bump(&s.puts),
                        RdmaKind::Get => TransportStats::bump(&s.gets),
                    }
                    if let Some(wid) = &g.wid {
                        wid.mark_complete();
                    }
                    g.state = RdmaState::Done;
                }
                RdmaState::Done => {
                    return true;
                }
            }
        }
    }

    /// Ok(true) = parked waiting on the remote, Ok(false) = already done.
    fn execute(t: &SocketsTransport, g: &RdmaInner, index: u32) -> NntiResult<bool> {
        let wid = g.wid.as_ref().ok_or(NntiError::Inval)?;
        let wr = wid.wr();
        let peer = wr.peer.clone().ok_or(NntiError::Inval)?;
        let remote = wr.remote_hdl.clone().ok_or(NntiError::Inval)?;
        let conn = t.connection_for_peer(&peer)?;

        match g.kind {
            RdmaKind::Get => {
                let mut flags = 0u8;
                if wr.flags & op_flags::REMOTE_EVENT != 0 {
                    flags |= req_flags::REMOTE_EVENT;
                }
                let req = wire::GetReq {
                    req_id: index,
                    flags,
                    base: remote.base(),
                    offset: wr.remote_offset,
                    length: wr.length,
                };
                conn.send_frame(tags::GET_REQ, &wire::build_get_req(&req))?;
                Ok(true)
            }
            RdmaKind::Put => {
                let local = wr.local_hdl.clone().ok_or(NntiError::Inval)?;
                let data = local.read_bytes(wr.local_offset, wr.length)?;
                let want_ack = wr.flags & op_flags::NO_ACK == 0;
                let mut flags = 0u8;
                if want_ack {
                    flags |= req_flags::WANT_ACK;
                }
                if wr.flags & op_flags::REMOTE_EVENT != 0 {
                    flags |= req_flags::REMOTE_EVENT;
                }
                let req = wire::PutReq {
                    req_id: index,
                    flags,
                    base: remote.base(),
                    offset: wr.remote_offset,
                    data: &data,
                };
                conn.send_frame(tags::PUT_REQ, &wire::build_put_req(&req))?;
                Ok(want_ack)
            }
        }
    }

    fn issue_event(&self, t: &SocketsTransport, g: &RdmaInner) {
        let wid = match &g.wid {
            Some(w) => w,
            None => return,
        };
        let wr = wid.wr();
        let mut ev = t.take_event();
        ev.transport = TransportId::Sockets;
        ev.event_type = match g.kind {
            RdmaKind::Put => event_types::PUT,
            RdmaKind::Get => event_types::GET,
        };
        ev.result = g.result;
        ev.wid = wid.id();
        ev.op = match g.kind {
            RdmaKind::Put => OpKind::Put,
            RdmaKind::Get => OpKind::Get,
        };
        ev.peer_pid = wr.peer_pid();
        ev.start = wr.local_hdl.as_ref().map(|b| b.base()).unwrap_or(0);
        ev.offset = wr.local_offset;
        ev.length = wr.length;
        ev.context = wr.event_context;
        t.deliver_initiator_event(wr, ev);
    }
}
