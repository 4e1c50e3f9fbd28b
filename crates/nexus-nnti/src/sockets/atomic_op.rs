//! 64-bit remote atomics at the initiator.
//!
//! Fetch-add and compare-swap execute at the target's progress thread,
//! serialized against every other atomic on that transport, which gives the
//! same atomicity scope as NIC-side atomics on the rdma fabrics. The old
//! value comes back in the response and lands in the local buffer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{EventResult, NntiError, NntiResult};
use crate::sockets::wire::{self, atomic_kind, tags};
use crate::sockets::SocketsTransport;
use crate::stats::TransportStats;
use crate::types::{event_types, Event, OpKind, TransportId};
use crate::wid::WorkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AtomicState {
    Init,
    Execute,
    WaitResponse,
    IssueEvent,
    Cleanup,
    Done,
}

struct AtomicInner {
    state: AtomicState,
    wid: Option<Arc<WorkId>>,
    result: EventResult,
}

pub struct AtomicOp {
    index: AtomicU32,
    inner: Mutex<AtomicInner>,
}

impl AtomicOp {
    pub fn new(wid: Arc<WorkId>) -> Arc<AtomicOp> {
        Arc::new(AtomicOp {
            index: AtomicU32::new(u32::MAX),
            inner: Mutex::new(AtomicInner {
                state: AtomicState::Init,
                wid: Some(wid),
                result: Ok(()),
            }),
        })
    }

    pub fn reset(&mut self, wid: Arc<WorkId>) {
        self.index = AtomicU32::new(u32::MAX);
        let inner = self.inner.get_mut().unwrap();
        inner.state = AtomicState::Init;
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

    /// Response arrived: store the fetched old value locally and resume.
    pub fn complete(&self, t: &SocketsTransport, code: Option<NntiError>, old: i64) -> bool {
        {
            let mut g = self.inner.lock().unwrap();
            match code {
                Some(e) => g.result = Err(e),
                None => {
                    if let Some(wid) = &g.wid {
                        let wr = wid.wr();
                        if let Some(local) = &wr.local_hdl {
                            if let Err(e) = local.write_i64(wr.local_offset, old) {
                                g.result = Err(e);
                            }
                        }
                    }
                }
            }
        }
        self.update(t, &Event::noop())
    }

    /// Returns true when the op finished and should be retired.
    pub fn update(&self, t: &SocketsTransport, _ev: &Event) -> bool {
        let mut g = self.inner.lock().unwrap();
        loop {
            match g.state {
                AtomicState::Init => {
                    g.state = AtomicState::Execute;
                }
                AtomicState::Execute => match Self::execute(t, &g, self.index()) {
                    Ok(()) => {
                        g.state = AtomicState::WaitResponse;
                        return false;
                    }
                    Err(e) => {
                        g.result = Err(e);
                        g.state = AtomicState::IssueEvent;
                    }
                },
                AtomicState::WaitResponse => {
                    g.state = AtomicState::IssueEvent;
                }
                AtomicState::IssueEvent => {
                    self.issue_event(t, &g);
                    g.state = AtomicState::Cleanup;
                }
                AtomicState::Cleanup => {
                    TransportStats::bump(&t.stats().atomics);
                    if let Some(wid) = &g.wid {
                        wid.mark_complete();
                    }
                    g.state = AtomicState::Done;
                }
                AtomicState::Done => {
                    return true;
                }
            }
        }
    }

    fn execute(t: &SocketsTransport, g: &AtomicInner, index: u32) -> NntiResult<()> {
        let wid = g.wid.as_ref().ok_or(NntiError::Inval)?;
        let wr = wid.wr();
        let peer = wr.peer.clone().ok_or(NntiError::Inval)?;
        let remote = wr.remote_hdl.clone().ok_or(NntiError::Inval)?;
        let conn = t.connection_for_peer(&peer)?;

        let kind = match wr.op {
            OpKind::AtomicFadd => atomic_kind::FADD,
            OpKind::AtomicCswap => atomic_kind::CSWAP,
            _ => return Err(NntiError::Inval),
        };
        let req = wire::AtomicReq {
            req_id: index,
            kind,
            base: remote.base(),
            offset: wr.remote_offset,
            operand1: wr.operand1,
            operand2: wr.operand2,
        };
        conn.send_frame(tags::ATOMIC_REQ, &wire::build_atomic_req(&req))
    }

    fn issue_event(&self, t: &SocketsTransport, g: &AtomicInner) {
        let wid = match &g.wid {
            Some(w) => w,
            None => return,
        };
        let wr = wid.wr();
        let mut ev = t.take_event();
        ev.transport = TransportId::Sockets;
        ev.event_type = event_types::ATOMIC;
        ev.result = g.result;
        ev.wid = wid.id();
        ev.op = wr.op;
        ev.peer_pid = wr.peer_pid();
        ev.start = wr.local_hdl.as_ref().map(|b| b.base()).unwrap_or(0);
        ev.offset = wr.local_offset;
        ev.length = 8;
        ev.context = wr.event_context;
        t.deliver_initiator_event(wr, ev);
    }
}
