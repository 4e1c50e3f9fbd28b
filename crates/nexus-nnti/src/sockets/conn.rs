//! Per-peer connections.
//!
//! A connection is the full-duplex channel to one peer: a TCP stream (the
//! reader half belongs to the progress thread, the writer half is shared
//! behind a mutex), a send-credit counter sized to the peer's mailbox ring,
//! and the waitlist of ops stalled on credits. At most one connection exists
//! per remote pid; the connection map and vector own the lookup paths.

use std::collections::VecDeque;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nexus_common::nlog_debug;

use crate::error::{NntiError, NntiResult};
use crate::peer::Peer;
use crate::sockets::cmd_op::CmdOp;
use crate::sockets::wire::{self, Frame};

/// Lifecycle of a connection: created (`None`), rendezvous in flight
/// (`Establishing`), stream attached (`Ready`), closing (`Teardown`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    None,
    Establishing,
    Ready,
    Teardown,
}

pub struct Connection {
    index: AtomicU32,
    peer: Arc<Peer>,
    state: Mutex<ConnState>,
    writer: Mutex<Option<TcpStream>>,
    reader: Mutex<Option<TcpStream>>,
    send_credits: Mutex<u32>,
    waitlist: Mutex<VecDeque<Arc<CmdOp>>>,
    drain_lock: Mutex<()>,
}

impl Connection {
    pub fn new(peer: Arc<Peer>, cmd_msg_count: u32) -> Arc<Connection> {
        Arc::new(Connection {
            index: AtomicU32::new(u32::MAX),
            peer,
            state: Mutex::new(ConnState::None),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            send_credits: Mutex::new(cmd_msg_count),
            waitlist: Mutex::new(VecDeque::new()),
            drain_lock: Mutex::new(()),
        })
    }

    pub fn index(&self) -> u32 {
        self.index.load(Ordering::Acquire)
    }

    pub fn set_index(&self, index: u32) {
        self.index.store(index, Ordering::Release);
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, s: ConnState) {
        *self.state.lock().unwrap() = s;
    }

    /// Bind the data stream to this connection and mark it ready.
    pub fn attach_stream(&self, stream: TcpStream) -> NntiResult<()> {
        let _ = stream.set_nodelay(true);
        let reader = stream.try_clone().map_err(|_| NntiError::Io)?;
        *self.reader.lock().unwrap() = Some(reader);
        *self.writer.lock().unwrap() = Some(stream);
        self.set_state(ConnState::Ready);
        nlog_debug!("nnti", "connection {} ready (peer pid {:#x})", self.index(), self.peer.pid());
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnState::Ready
    }

    /// Write one frame. Frames are written whole under the writer lock, so
    /// interleaved senders never corrupt the stream.
    pub fn send_frame(&self, tag: u8, payload: &[u8]) -> NntiResult<()> {
        let mut g = self.writer.lock().unwrap();
        match g.as_mut() {
            Some(stream) => wire::write_frame(stream, tag, payload).map_err(|_| NntiError::Io),
            None => Err(NntiError::NotInit),
        }
    }

    /// Read one frame; only the progress thread does this.
    pub fn read_frame(&self) -> NntiResult<Frame> {
        let mut g = self.reader.lock().unwrap();
        match g.as_mut() {
            Some(stream) => wire::read_frame(stream).map_err(|_| NntiError::Io),
            None => Err(NntiError::NotInit),
        }
    }

    pub fn reader_fd(&self) -> Option<RawFd> {
        self.reader.lock().unwrap().as_ref().map(|s| s.as_raw_fd())
    }

    // -- credits -------------------------------------------------------------

    pub fn take_credit(&self) -> bool {
        let mut c = self.send_credits.lock().unwrap();
        if *c == 0 {
            return false;
        }
        *c -= 1;
        true
    }

    pub fn add_credits(&self, n: u32) {
        let mut c = self.send_credits.lock().unwrap();
        *c += n;
    }

    pub fn credits(&self) -> u32 {
        *self.send_credits.lock().unwrap()
    }

    // -- credit waitlist -----------------------------------------------------

    pub fn waitlist_push(&self, op: Arc<CmdOp>) {
        self.waitlist.lock().unwrap().push_back(op);
    }

    /// Put a still-stalled op back at the head so order is preserved.
    pub fn waitlist_push_front(&self, op: Arc<CmdOp>) {
        self.waitlist.lock().unwrap().push_front(op);
    }

    pub fn waitlist_pop(&self) -> Option<Arc<CmdOp>> {
        self.waitlist.lock().unwrap().pop_front()
    }

    pub fn waitlist_len(&self) -> usize {
        self.waitlist.lock().unwrap().len()
    }

    /// Serializes waitlist draining so resumed sends keep their order even
    /// when credits arrive while a user thread is parking an op.
    pub fn drain_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.drain_lock.lock().unwrap()
    }

    /// Drop the streams; any blocked reader returns an error.
    pub fn close(&self) {
        self.set_state(ConnState::Teardown);
        if let Some(s) = self.writer.lock().unwrap().take() {
            let _ = s.shutdown(std::net::Shutdown::Both);
        }
        *self.reader.lock().unwrap() = None;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.index())
            .field("peer_pid", &format_args!("{:#x}", self.peer.pid()))
            .field("state", &self.state())
            .field("credits", &self.credits())
            .field("waitlist", &self.waitlist_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nurl::TransportUrl;

    fn peer() -> Arc<Peer> {
        Peer::new(TransportUrl::parse("sockets://127.0.0.1:9999").unwrap())
    }

    #[test]
    fn test_credit_accounting() {
        let c = Connection::new(peer(), 4);
        assert_eq!(c.credits(), 4);
        for _ in 0..4 {
            assert!(c.take_credit());
        }
        assert!(!c.take_credit(), "ring exhausted");
        c.add_credits(2);
        assert!(c.take_credit());
        assert_eq!(c.credits(), 1);
    }

    #[test]
    fn test_send_before_attach_fails() {
        let c = Connection::new(peer(), 4);
        assert_eq!(c.send_frame(wire::tags::CREDIT, &[0, 0, 0, 0]), Err(NntiError::NotInit));
    }

    #[test]
    fn test_state_progression() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let c = Connection::new(peer(), 4);
        assert_eq!(c.state(), ConnState::None);
        c.set_state(ConnState::Establishing);
        assert!(!c.is_ready());

        let stream = TcpStream::connect(addr).unwrap();
        let _accepted = listener.accept().unwrap();
        c.attach_stream(stream).unwrap();
        assert_eq!(c.state(), ConnState::Ready);

        c.close();
        assert_eq!(c.state(), ConnState::Teardown);
        assert_eq!(c.send_frame(wire::tags::GOODBYE, &[]), Err(NntiError::NotInit));
    }

    #[test]
    fn test_frames_flow_over_localhost_pair() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let a = Connection::new(peer(), 4);
        let b = Connection::new(peer(), 4);
        a.attach_stream(client).unwrap();
        b.attach_stream(server_side).unwrap();
        assert!(a.is_ready());

        a.send_frame(wire::tags::CREDIT, &wire::build_credit(7)).unwrap();
        let f = b.read_frame().unwrap();
        assert_eq!(f.tag, wire::tags::CREDIT);
        assert_eq!(wire::parse_credit(&f.payload).unwrap(), 7);
    }
}
