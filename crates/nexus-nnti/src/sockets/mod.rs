//! The sockets fabric.
//!
//! TCP renders the transport contract the way the message-passing fabrics
//! do: mailbox command frames with credit flow control for sends, and a
//! service path where the remote progress thread executes one-sided
//! get/put/atomic requests against its registered-buffer map. Connection
//! setup rendezvouses over the peer's control-plane server; the data stream
//! itself is a direct TCP dial to the port learned in the reply.
//!
//! One progress thread per transport owns all socket reads, `poll(2)`-ing
//! every connection plus the listener and a wake pipe. User threads only
//! post work and drain event queues.

pub mod wire;
pub mod cmd_msg;
pub mod conn;
pub mod cmd_op;
pub mod cmd_tgt;
pub mod rdma_op;
pub mod atomic_op;
mod progress;

use std::collections::{HashMap, VecDeque};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use nexus_common::config::Configuration;
use nexus_common::{nlog_debug, nlog_info, nlog_warn};
use nexus_whookie::{http_get, parse_kv_body, Server};

use crate::buffer::Buffer;
use crate::eq::EventQueue;
use crate::error::{NntiError, NntiResult};
use crate::freelist::Freelist;
use crate::nurl::TransportUrl;
use crate::opvec::IndexVector;
use crate::packable::{PackedBuffer, PackedPeer};
use crate::peer::Peer;
use crate::stats::TransportStats;
use crate::types::{
    eq_flags, event_types, Event, OpKind, TransportAttrs, TransportId,
};
use crate::wid::WorkId;
use crate::wr::{EventCallback, WorkRequest};

use atomic_op::AtomicOp;
use cmd_msg::CmdMsg;
use cmd_op::{CmdOp, UPDATE_DONE, UPDATE_WAITLISTED};
use cmd_tgt::CmdTgt;
use conn::{ConnState, Connection};
use rdma_op::{RdmaKind, RdmaOp};
use wire::{tags, BLOCKING_REQ_BIT};

const CONNECT_RETRIES: u32 = 5;
const CONNECT_RETRY_BACKOFF_MS: u64 = 1000;

/// Any in-flight op, addressable by its op-vector index.
#[derive(Clone)]
pub(crate) enum OpRef {
    Cmd(Arc<CmdOp>),
    Tgt(Arc<CmdTgt>),
    Rdma(Arc<RdmaOp>),
    Atomic(Arc<AtomicOp>),
}

struct RuntimeState {
    started: bool,
    url: Option<TransportUrl>,
    me: Option<Arc<Peer>>,
    data_port: u16,
    progress_thread: Option<thread::JoinHandle<()>>,
}

struct BlockingGet {
    dst: Arc<Buffer>,
    dst_off: u64,
    tx: mpsc::SyncSender<NntiResult<()>>,
}

pub struct SocketsTransport {
    whookie: Arc<Server>,
    cmd_msg_size: u32,
    cmd_msg_count: u32,
    state: Mutex<RuntimeState>,
    conn_map: Mutex<HashMap<u64, Arc<Connection>>>,
    conn_vector: IndexVector<Arc<Connection>>,
    op_vector: IndexVector<OpRef>,
    buffer_map: Mutex<HashMap<u64, Arc<Buffer>>>,
    wid_map: Mutex<HashMap<u32, Arc<WorkId>>>,
    unexpected_q: Mutex<Option<Arc<EventQueue>>>,
    unexpected_msgs: Mutex<VecDeque<Arc<CmdTgt>>>,
    pending_blocking: Mutex<HashMap<u32, BlockingGet>>,
    next_blocking_id: AtomicU32,
    stats: TransportStats,
    event_fl: Freelist<Event>,
    cmd_op_fl: Freelist<Arc<CmdOp>>,
    cmd_tgt_fl: Freelist<Arc<CmdTgt>>,
    rdma_op_fl: Freelist<Arc<RdmaOp>>,
    atomic_op_fl: Freelist<Arc<AtomicOp>>,
    atomics_lock: Mutex<()>,
    shutdown: AtomicBool,
    wake_pipe: (RawFd, RawFd),
    interrupt_pipe: (RawFd, RawFd),
    progress_tid: Mutex<Option<thread::ThreadId>>,
}

fn nonblocking_pipe() -> NntiResult<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(NntiError::Io);
    }
    for fd in fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    Ok((fds[0], fds[1]))
}

fn drain_fd(fd: RawFd) {
    let mut sink = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, sink.as_mut_ptr() as *mut libc::c_void, sink.len()) };
        if n <= 0 {
            break;
        }
    }
}

impl SocketsTransport {
    pub fn new(whookie: Arc<Server>, config: &Configuration) -> NntiResult<Arc<SocketsTransport>> {
        let cmd_msg_size = config
            .get_uint("nnti.cmd_msg_size", "2048")
            .map_err(|_| NntiError::Inval)? as u32;
        let cmd_msg_count = config
            .get_uint("nnti.cmd_msg_count", "64")
            .map_err(|_| NntiError::Inval)? as u32;
        let fl_size = config
            .get_uint("nnti.freelist.size", "128")
            .map_err(|_| NntiError::Inval)? as usize;
        if (cmd_msg_size as usize) <= cmd_msg::HEADER_LEN || cmd_msg_count == 0 {
            return Err(NntiError::Inval);
        }

        Ok(Arc::new(SocketsTransport {
            whookie,
            cmd_msg_size,
            cmd_msg_count,
            state: Mutex::new(RuntimeState {
                started: false,
                url: None,
                me: None,
                data_port: 0,
                progress_thread: None,
            }),
            conn_map: Mutex::new(HashMap::new()),
            conn_vector: IndexVector::new(16),
            op_vector: IndexVector::new(256),
            buffer_map: Mutex::new(HashMap::new()),
            wid_map: Mutex::new(HashMap::new()),
            unexpected_q: Mutex::new(None),
            unexpected_msgs: Mutex::new(VecDeque::new()),
            pending_blocking: Mutex::new(HashMap::new()),
            next_blocking_id: AtomicU32::new(1),
            stats: TransportStats::default(),
            event_fl: Freelist::new(fl_size),
            cmd_op_fl: Freelist::new(fl_size),
            cmd_tgt_fl: Freelist::new(fl_size),
            rdma_op_fl: Freelist::new(fl_size),
            atomic_op_fl: Freelist::new(fl_size),
            atomics_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            wake_pipe: nonblocking_pipe()?,
            interrupt_pipe: nonblocking_pipe()?,
            progress_tid: Mutex::new(None),
        }))
    }

    // -- lifecycle -----------------------------------------------------------

    /// Bring the fabric up: data listener, progress thread, control hooks.
    /// Idempotent.
    pub fn start(self: &Arc<Self>) -> NntiResult<()> {
        {
            let mut st = self.state.lock().unwrap();
            if st.started {
                return Ok(());
            }
            if !self.whookie.is_running() {
                return Err(NntiError::NotInit);
            }

            let mut ip = self.whookie.address();
            if ip.is_unspecified() {
                ip = std::net::Ipv4Addr::LOCALHOST;
            }
            let url = TransportUrl::new("sockets", &ip.to_string(), self.whookie.port());
            let me = Peer::new(url.clone());

            let listener = TcpListener::bind((ip, 0)).map_err(|_| NntiError::Io)?;
            let data_port = listener.local_addr().map_err(|_| NntiError::Io)?.port();

            self.shutdown.store(false, Ordering::SeqCst);
            let t = self.clone();
            let handle = thread::Builder::new()
                .name("nnti-progress".to_string())
                .spawn(move || progress::run(t, listener))
                .map_err(|_| NntiError::Io)?;

            nlog_info!("nnti", "sockets transport at {} (data port {})", url, data_port);
            st.url = Some(url);
            st.me = Some(me);
            st.data_port = data_port;
            st.progress_thread = Some(handle);
            st.started = true;
        }
        self.install_hooks();
        Ok(())
    }

    /// Tear the fabric down. Idempotent; connected peers are notified on a
    /// best-effort basis by the connection teardown itself.
    pub fn stop(&self) {
        let handle = {
            let mut st = self.state.lock().unwrap();
            if !st.started {
                return;
            }
            st.started = false;
            st.progress_thread.take()
        };

        for path in Self::hook_paths() {
            self.whookie.deregister_hook(path);
        }

        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_progress();
        if let Some(h) = handle {
            let _ = h.join();
        }

        // fail anything still blocked on a synchronous retrieval
        for (_, bg) in self.pending_blocking.lock().unwrap().drain() {
            let _ = bg.tx.send(Err(NntiError::Canceled));
        }

        let conns: Vec<Arc<Connection>> =
            self.conn_map.lock().unwrap().drain().map(|(_, c)| c).collect();
        for c in conns {
            let _ = c.send_frame(tags::GOODBYE, &[]);
            self.conn_vector.remove(c.index());
            c.close();
        }
        self.unexpected_msgs.lock().unwrap().clear();
        self.wid_map.lock().unwrap().clear();
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn attrs(&self) -> TransportAttrs {
        TransportAttrs {
            mtu: self.cmd_msg_size,
            max_cmd_header_size: cmd_msg::HEADER_LEN as u32,
            max_eager_size: CmdMsg::eager_capacity(self.cmd_msg_size) as u32,
            cmd_queue_size: self.cmd_msg_count,
        }
    }

    pub fn get_url(&self) -> NntiResult<String> {
        let st = self.state.lock().unwrap();
        st.url
            .as_ref()
            .map(|u| u.url_string())
            .ok_or(NntiError::NotInit)
    }

    pub fn pid(&self) -> NntiResult<u64> {
        let st = self.state.lock().unwrap();
        st.url.as_ref().map(|u| u.pid()).ok_or(NntiError::NotInit)
    }

    pub fn me(&self) -> NntiResult<Arc<Peer>> {
        let st = self.state.lock().unwrap();
        st.me.clone().ok_or(NntiError::NotInit)
    }

    pub(crate) fn data_port(&self) -> u16 {
        self.state.lock().unwrap().data_port
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    // -- control-plane hooks -------------------------------------------------

    fn hook_paths() -> [&'static str; 4] {
        [
            "/nnti/sockets/connect",
            "/nnti/sockets/disconnect",
            "/nnti/sockets/stats",
            "/nnti/sockets/peers",
        ]
    }

    fn install_hooks(self: &Arc<Self>) {
        let t = self.clone();
        self.whookie.update_hook("/nnti/sockets/connect", Arc::new(move |args, rs| {
            match t.handle_connect_request(args) {
                Ok(reply) => rs.raw(&reply),
                Err(e) => rs.raw(&format!("error={}", e)),
            }
        }));

        let t = self.clone();
        self.whookie.update_hook("/nnti/sockets/disconnect", Arc::new(move |args, rs| {
            if let Some(pid) = args.get("pid").and_then(|s| u64::from_str_radix(s, 16).ok()) {
                t.remove_connection_by_pid(pid);
                rs.raw("ok");
            } else {
                rs.raw("error=bad pid");
            }
        }));

        let t = self.clone();
        self.whookie.update_hook("/nnti/sockets/stats", Arc::new(move |_args, rs| {
            rs.table_begin("Transport Stats");
            rs.table_top(&["Counter", "Value"]);
            for (name, v) in t.stats.snapshot() {
                rs.table_row(&[name.to_string(), v.to_string()]);
            }
            rs.table_end();
            rs.finish();
        }));

        let t = self.clone();
        self.whookie.update_hook("/nnti/sockets/peers", Arc::new(move |_args, rs| {
            rs.table_begin("Peers");
            rs.table_top(&["Pid", "Url", "Index", "State", "Credits"]);
            let conns: Vec<Arc<Connection>> =
                t.conn_map.lock().unwrap().values().cloned().collect();
            for c in conns {
                rs.table_row(&[
                    format!("{:#x}", c.peer().pid()),
                    c.peer().url().url_string(),
                    c.index().to_string(),
                    format!("{:?}", c.state()),
                    c.credits().to_string(),
                ]);
            }
            rs.table_end();
            rs.finish();
        }));
    }

    /// Target half of connection rendezvous: record the half-open connection
    /// and tell the initiator where to dial.
    fn handle_connect_request(
        &self,
        args: &std::collections::BTreeMap<String, String>,
    ) -> NntiResult<String> {
        let hostname = args.get("hostname").ok_or(NntiError::Inval)?;
        let port: u16 = args
            .get("port")
            .and_then(|s| s.parse().ok())
            .ok_or(NntiError::Inval)?;
        let url = TransportUrl::new("sockets", hostname, port);
        let pid = url.pid();

        let conn = {
            let mut m = self.conn_map.lock().unwrap();
            match m.get(&pid) {
                Some(c) => c.clone(),
                None => {
                    let peer = Peer::new(url);
                    let c = Connection::new(peer.clone(), self.cmd_msg_count);
                    let idx = self.conn_vector.add(c.clone());
                    c.set_index(idx);
                    peer.set_conn_index(idx);
                    // half-open until the initiator dials the data port
                    c.set_state(ConnState::Establishing);
                    m.insert(pid, c.clone());
                    nlog_debug!("nnti", "inbound rendezvous from pid {:#x} (conn {})", pid, idx);
                    c
                }
            }
        };

        let my_pid = self.pid()?;
        Ok(format!(
            "conn_index={}\ndata_port={}\nfingerprint={:x}\n",
            conn.index(),
            self.data_port(),
            my_pid
        ))
    }

    // -- connections ---------------------------------------------------------

    /// Connect to a peer named by its transport url. At most one connection
    /// per peer exists; repeat calls hand back the cached peer.
    pub fn connect(&self, url_str: &str, timeout_ms: u64) -> NntiResult<Arc<Peer>> {
        if !self.is_started() {
            return Err(NntiError::NotInit);
        }
        let url = TransportUrl::parse(url_str)?;
        let pid = url.pid();

        let (peer, conn) = {
            let mut m = self.conn_map.lock().unwrap();
            if let Some(c) = m.get(&pid) {
                return Ok(c.peer().clone());
            }
            let peer = Peer::new(url.clone());
            let conn = Connection::new(peer.clone(), self.cmd_msg_count);
            let idx = self.conn_vector.add(conn.clone());
            conn.set_index(idx);
            peer.set_conn_index(idx);
            m.insert(pid, conn.clone());
            (peer, conn)
        };

        conn.set_state(ConnState::Establishing);
        match self.establish(&url, &conn, timeout_ms) {
            Ok(()) => {
                self.wake_progress();
                Ok(peer)
            }
            Err(e) => {
                self.conn_map.lock().unwrap().remove(&pid);
                self.conn_vector.remove(conn.index());
                Err(e)
            }
        }
    }

    fn establish(
        &self,
        url: &TransportUrl,
        conn: &Arc<Connection>,
        timeout_ms: u64,
    ) -> NntiResult<()> {
        let my_url = self.get_url()?;
        let my_parsed = TransportUrl::parse(&my_url)?;
        let my_pid = my_parsed.pid();
        let target_ip = url.ip()?;

        let path = format!(
            "/nnti/sockets/connect?hostname={}&addr={}&port={}&fingerprint={:x}&data_port={}&conn_index={}",
            my_parsed.hostname(),
            u32::from(my_parsed.ip()?),
            my_parsed.port(),
            my_pid,
            self.data_port(),
            conn.index()
        );

        // The peer's control plane may come up after ours; retry with
        // backoff before declaring the rendezvous dead.
        let per_try = Duration::from_millis(timeout_ms.clamp(100, 5000));
        let mut reply = None;
        for attempt in 0..CONNECT_RETRIES {
            match http_get(target_ip, url.port(), &path, per_try) {
                Ok((200, body)) => {
                    reply = Some(body);
                    break;
                }
                Ok((status, _)) => {
                    nlog_debug!("nnti", "rendezvous attempt {} got http {}", attempt, status);
                }
                Err(e) => {
                    nlog_debug!("nnti", "rendezvous attempt {} failed: {}", attempt, e);
                }
            }
            if attempt + 1 < CONNECT_RETRIES {
                thread::sleep(Duration::from_millis(CONNECT_RETRY_BACKOFF_MS));
            }
        }
        let body = reply.ok_or(NntiError::Timedout)?;

        let kv = parse_kv_body(&body);
        let find = |k: &str| kv.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        let target_index: u32 = find("conn_index")
            .and_then(|s| s.parse().ok())
            .ok_or(NntiError::Decode)?;
        let target_data_port: u16 = find("data_port")
            .and_then(|s| s.parse().ok())
            .ok_or(NntiError::Decode)?;

        let mut stream = TcpStream::connect_timeout(
            &std::net::SocketAddr::from((target_ip, target_data_port)),
            per_try,
        )
        .map_err(|_| NntiError::Io)?;
        let hello = wire::build_hello(target_index, my_pid, &my_url);
        wire::write_frame(&mut stream, tags::HELLO, &hello).map_err(|_| NntiError::Io)?;
        conn.attach_stream(stream)?;
        Ok(())
    }

    /// Tear a connection down, best-effort notifying the peer's control
    /// plane so it drops its half too.
    pub fn disconnect(&self, peer: &Arc<Peer>) -> NntiResult<()> {
        let conn = {
            let mut m = self.conn_map.lock().unwrap();
            m.remove(&peer.pid()).ok_or(NntiError::Inval)?
        };
        self.conn_vector.remove(conn.index());
        let _ = conn.send_frame(tags::GOODBYE, &[]);

        if let Ok(my_pid) = self.pid() {
            if let Ok(ip) = peer.url().ip() {
                let path = format!("/nnti/sockets/disconnect?pid={:x}", my_pid);
                let _ = http_get(ip, peer.url().port(), &path, Duration::from_millis(500));
            }
        }
        conn.close();
        peer.clear_conn_index();
        Ok(())
    }

    pub(crate) fn remove_connection_by_pid(&self, pid: u64) {
        let conn = self.conn_map.lock().unwrap().remove(&pid);
        if let Some(c) = conn {
            self.conn_vector.remove(c.index());
            c.peer().clear_conn_index();
            c.close();
        }
    }

    pub(crate) fn drop_connection(&self, conn: &Arc<Connection>) {
        self.remove_connection_by_pid(conn.peer().pid());
    }

    pub(crate) fn connection_for_peer(&self, peer: &Arc<Peer>) -> NntiResult<Arc<Connection>> {
        if let Some(i) = peer.conn_index() {
            if let Some(c) = self.conn_vector.get(i) {
                if c.peer().pid() == peer.pid() {
                    return Ok(c);
                }
            }
        }
        let m = self.conn_map.lock().unwrap();
        match m.get(&peer.pid()) {
            Some(c) => {
                peer.set_conn_index(c.index());
                Ok(c.clone())
            }
            None => Err(NntiError::NotInit),
        }
    }

    pub(crate) fn conn_by_index(&self, index: u32) -> Option<Arc<Connection>> {
        self.conn_vector.get(index)
    }

    pub(crate) fn conn_poll_snapshot(&self) -> Vec<(RawFd, Arc<Connection>)> {
        let m = self.conn_map.lock().unwrap();
        m.values()
            .filter_map(|c| c.reader_fd().map(|fd| (fd, c.clone())))
            .collect()
    }

    // -- memory --------------------------------------------------------------

    /// Allocate pinned, transport-addressable memory.
    pub fn alloc(
        &self,
        size: u64,
        flags: u32,
        eq: Option<Arc<EventQueue>>,
        callback: Option<EventCallback>,
        cb_context: u64,
    ) -> NntiResult<Arc<Buffer>> {
        let b = Buffer::alloc(size, flags, eq, callback, cb_context)?;
        self.buffer_map.lock().unwrap().insert(b.base(), b.clone());
        Ok(b)
    }

    /// Register caller-owned memory; see [`Buffer::register`] for the
    /// validity contract.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+size` must stay valid until `unregister_memory`.
    pub unsafe fn register_memory(
        &self,
        ptr: *mut u8,
        size: u64,
        flags: u32,
        eq: Option<Arc<EventQueue>>,
        callback: Option<EventCallback>,
        cb_context: u64,
    ) -> NntiResult<Arc<Buffer>> {
        let b = Buffer::register(ptr, size, flags, eq, callback, cb_context)?;
        self.buffer_map.lock().unwrap().insert(b.base(), b.clone());
        Ok(b)
    }

    /// Remove from the buffer map; remote operations arriving afterwards
    /// fail their lookup rather than touching freed memory.
    pub fn unregister_memory(&self, b: &Arc<Buffer>) -> NntiResult<()> {
        self.buffer_map
            .lock()
            .unwrap()
            .remove(&b.base())
            .map(|_| ())
            .ok_or(NntiError::Inval)
    }

    /// Release a transport-allocated buffer.
    pub fn free(&self, b: &Arc<Buffer>) -> NntiResult<()> {
        self.unregister_memory(b)
    }

    pub(crate) fn lookup_buffer(&self, base: u64) -> Option<Arc<Buffer>> {
        self.buffer_map.lock().unwrap().get(&base).cloned()
    }

    // -- wire forms ----------------------------------------------------------

    pub fn dt_pack_buffer(&self, b: &Arc<Buffer>) -> Vec<u8> {
        PackedBuffer::Sockets { buf: b.base(), size: b.length() }.pack()
    }

    /// Rebuild a buffer handle from its wire form, deduplicating against the
    /// local registry: a descriptor of locally registered memory resolves to
    /// the registered buffer itself.
    pub fn dt_unpack_buffer(&self, raw: &[u8]) -> NntiResult<Arc<Buffer>> {
        match PackedBuffer::unpack(raw)? {
            PackedBuffer::Sockets { buf, size } => match self.lookup_buffer(buf) {
                Some(local) => Ok(local),
                None => Ok(Buffer::remote_descriptor(buf, size)),
            },
            PackedBuffer::Null => Err(NntiError::Decode),
            _ => Err(NntiError::Notsup),
        }
    }

    pub fn dt_pack_peer(&self, p: &Arc<Peer>) -> Vec<u8> {
        PackedPeer {
            pid: p.pid(),
            transport: TransportId::Sockets,
            hostname: p.url().hostname().to_string(),
            port: p.url().port(),
        }
        .pack()
    }

    /// Rebuild a peer from its wire form; a connected peer resolves to the
    /// live handle.
    pub fn dt_unpack_peer(&self, raw: &[u8]) -> NntiResult<Arc<Peer>> {
        let pp = PackedPeer::unpack(raw)?;
        if pp.transport != TransportId::Sockets {
            return Err(NntiError::Notsup);
        }
        if let Some(c) = self.conn_map.lock().unwrap().get(&pp.pid) {
            return Ok(c.peer().clone());
        }
        Ok(Peer::new(TransportUrl::new("sockets", &pp.hostname, pp.port)))
    }

    // -- event queues --------------------------------------------------------

    /// Create an event queue. At most one queue per transport may carry the
    /// UNEXPECTED flag.
    pub fn eq_create(&self, size: u64, flags: u32) -> NntiResult<Arc<EventQueue>> {
        let q = EventQueue::new(size, flags)?;
        if flags & eq_flags::UNEXPECTED != 0 {
            self.adopt_unexpected_queue(&q)?;
        }
        Ok(q)
    }

    pub fn eq_create_with_callback(
        &self,
        size: u64,
        flags: u32,
        callback: EventCallback,
        cb_context: u64,
    ) -> NntiResult<Arc<EventQueue>> {
        let q = EventQueue::with_callback(size, flags, callback, cb_context)?;
        if flags & eq_flags::UNEXPECTED != 0 {
            self.adopt_unexpected_queue(&q)?;
        }
        Ok(q)
    }

    fn adopt_unexpected_queue(&self, q: &Arc<EventQueue>) -> NntiResult<()> {
        let mut g = self.unexpected_q.lock().unwrap();
        if g.is_some() {
            return Err(NntiError::Exist);
        }
        *g = Some(q.clone());
        Ok(())
    }

    pub fn eq_destroy(&self, q: &Arc<EventQueue>) {
        let mut g = self.unexpected_q.lock().unwrap();
        if let Some(u) = g.as_ref() {
            if Arc::ptr_eq(u, q) {
                *g = None;
            }
        }
    }

    pub(crate) fn unexpected_queue(&self) -> Option<Arc<EventQueue>> {
        self.unexpected_q.lock().unwrap().clone()
    }

    pub(crate) fn enqueue_unexpected(&self, tgt: Arc<CmdTgt>) {
        self.unexpected_msgs.lock().unwrap().push_back(tgt);
    }

    /// Block until one of `eqs` holds an event or the timeout passes.
    /// `interrupt()` aborts the wait with Intr.
    pub fn eq_wait(
        &self,
        eqs: &[Arc<EventQueue>],
        timeout_ms: u64,
    ) -> NntiResult<(usize, Event)> {
        if eqs.is_empty() {
            return Err(NntiError::Inval);
        }
        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            for (i, q) in eqs.iter().enumerate() {
                if let Some(ev) = q.pop() {
                    return Ok((i, ev));
                }
            }

            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(NntiError::Timedout);
            }
            let remain = (deadline - now).as_millis().min(i32::MAX as u128) as i32;

            let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(eqs.len() + 1);
            pfds.push(libc::pollfd {
                fd: self.interrupt_pipe.0,
                events: libc::POLLIN,
                revents: 0,
            });
            for q in eqs {
                pfds.push(libc::pollfd { fd: q.read_fd(), events: libc::POLLIN, revents: 0 });
            }
            let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, remain) };
            if rc < 0 {
                let errno = nexus_common::error::last_errno();
                if errno == libc::EINTR {
                    continue;
                }
                return Err(NntiError::Io);
            }
            if pfds[0].revents & libc::POLLIN != 0 {
                drain_fd(self.interrupt_pipe.0);
                return Err(NntiError::Intr);
            }
            for (i, q) in eqs.iter().enumerate() {
                if pfds[i + 1].revents & libc::POLLIN != 0 {
                    q.drain_notifications();
                }
            }
        }
    }

    /// Unblock a pending `eq_wait` without touching in-flight i/o.
    pub fn interrupt(&self) {
        let token: u32 = 1;
        unsafe {
            libc::write(
                self.interrupt_pipe.1,
                &token as *const u32 as *const libc::c_void,
                4,
            );
        }
    }

    // -- data movement -------------------------------------------------------

    fn prepare_wid(&self, wr: &WorkRequest) -> NntiResult<Arc<WorkId>> {
        if wr.length > 0 {
            let local = wr.local_hdl.as_ref().ok_or(NntiError::Inval)?;
            if wr
                .local_offset
                .checked_add(wr.length)
                .map(|end| end > local.length())
                .unwrap_or(true)
            {
                return Err(NntiError::Inval);
            }
        }
        let wid = WorkId::new(wr.clone());
        self.wid_map.lock().unwrap().insert(wid.id(), wid.clone());
        Ok(wid)
    }

    fn ensure_connected(&self, peer: &Arc<Peer>) -> NntiResult<Arc<Connection>> {
        match self.connection_for_peer(peer) {
            Ok(c) => Ok(c),
            Err(_) => {
                // lazily connect on first send
                self.connect(&peer.url().url_string(), 1000)?;
                self.connection_for_peer(peer)
            }
        }
    }

    /// Post a message send. Never blocks on the network: out-of-credit ops
    /// park on the connection's waitlist and the wid is still returned.
    pub fn send(&self, wr: &WorkRequest) -> NntiResult<u32> {
        if wr.op != OpKind::Send {
            return Err(NntiError::Inval);
        }
        let peer = wr.peer.clone().ok_or(NntiError::Inval)?;
        let conn = self.ensure_connected(&peer)?;
        let wid = self.prepare_wid(wr)?;

        let msg = CmdMsg::pack(wid.id(), 0, wr, self.pid()?, self.cmd_msg_size)?;
        let op = self.make_cmd_op(wid.clone(), msg);
        let idx = self.op_vector.add(OpRef::Cmd(op.clone()));
        op.set_index(idx);
        op.set_src_op_id(idx);

        // older sends already stalled on credits go first
        let rc = if conn.waitlist_len() > 0 {
            op.park_for_credits();
            UPDATE_WAITLISTED
        } else {
            op.update(self, &Event::noop())
        };
        match rc {
            UPDATE_WAITLISTED => {
                conn.waitlist_push(op);
                // a credit may have come home while we were parking
                if conn.credits() > 0 {
                    self.drain_waitlist(&conn);
                }
            }
            UPDATE_DONE => self.retire_op(idx),
            _ => {}
        }
        Ok(wid.id())
    }

    /// One-sided write into the peer's registered region.
    pub fn put(&self, wr: &WorkRequest) -> NntiResult<u32> {
        self.post_rdma(wr, OpKind::Put, RdmaKind::Put)
    }

    /// One-sided read from the peer's registered region.
    pub fn get(&self, wr: &WorkRequest) -> NntiResult<u32> {
        self.post_rdma(wr, OpKind::Get, RdmaKind::Get)
    }

    fn post_rdma(&self, wr: &WorkRequest, want: OpKind, kind: RdmaKind) -> NntiResult<u32> {
        if wr.op != want {
            return Err(NntiError::Inval);
        }
        let peer = wr.peer.clone().ok_or(NntiError::Inval)?;
        if wr.remote_hdl.is_none() {
            return Err(NntiError::Inval);
        }
        self.ensure_connected(&peer)?;
        let wid = self.prepare_wid(wr)?;

        let op = self.make_rdma_op(kind, wid.clone());
        let idx = self.op_vector.add(OpRef::Rdma(op.clone()));
        op.set_index(idx);

        if op.update(self, &Event::noop()) {
            self.retire_op(idx);
        }
        Ok(wid.id())
    }

    /// Atomic fetch-add of `operand1` at the remote offset.
    pub fn atomic_fop(&self, wr: &WorkRequest) -> NntiResult<u32> {
        self.post_atomic(wr, OpKind::AtomicFadd)
    }

    /// Atomic compare (`operand1`) and swap (`operand2`) at the remote
    /// offset.
    pub fn atomic_cswap(&self, wr: &WorkRequest) -> NntiResult<u32> {
        self.post_atomic(wr, OpKind::AtomicCswap)
    }

    fn post_atomic(&self, wr: &WorkRequest, want: OpKind) -> NntiResult<u32> {
        if wr.op != want {
            return Err(NntiError::Inval);
        }
        let peer = wr.peer.clone().ok_or(NntiError::Inval)?;
        if wr.remote_hdl.is_none() || wr.local_hdl.is_none() {
            return Err(NntiError::Inval);
        }
        self.ensure_connected(&peer)?;
        let wid = self.prepare_wid(wr)?;

        let op = self.make_atomic_op(wid.clone());
        let idx = self.op_vector.add(OpRef::Atomic(op.clone()));
        op.set_index(idx);

        if op.update(self, &Event::noop()) {
            self.retire_op(idx);
        }
        Ok(wid.id())
    }

    /// Best-effort cancel: marks the op; a late completion still fires and
    /// is reconciled against the flag.
    pub fn cancel(&self, wid_id: u32) -> NntiResult<()> {
        match self.wid_map.lock().unwrap().get(&wid_id) {
            Some(w) => {
                w.cancel();
                Ok(())
            }
            None => Err(NntiError::Noent),
        }
    }

    pub fn cancelall(&self) {
        for w in self.wid_map.lock().unwrap().values() {
            w.cancel();
        }
    }

    /// Block until the given wid completes.
    pub fn wait(&self, wid_id: u32, timeout_ms: u64) -> NntiResult<()> {
        let wid = self
            .wid_map
            .lock()
            .unwrap()
            .get(&wid_id)
            .cloned();
        match wid {
            Some(w) => w.wait(Duration::from_millis(timeout_ms)),
            // unknown wid: already completed and retired
            None => Ok(()),
        }
    }

    /// Block until every listed wid completes.
    pub fn waitall(&self, wid_ids: &[u32], timeout_ms: u64) -> NntiResult<()> {
        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
        for id in wid_ids {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(NntiError::Timedout);
            }
            self.wait(*id, (deadline - now).as_millis() as u64)?;
        }
        Ok(())
    }

    /// Block until at least one listed wid completes; returns its position.
    pub fn waitany(&self, wid_ids: &[u32], timeout_ms: u64) -> NntiResult<usize> {
        if wid_ids.is_empty() {
            return Err(NntiError::Inval);
        }
        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            for (i, id) in wid_ids.iter().enumerate() {
                let wid = self.wid_map.lock().unwrap().get(id).cloned();
                match wid {
                    // retired wids have already completed
                    None => return Ok(i),
                    Some(w) => {
                        if w.is_complete() {
                            return Ok(i);
                        }
                    }
                }
            }
            if std::time::Instant::now() >= deadline {
                return Err(NntiError::Timedout);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Retrieve the next staged unexpected message into `dst` at `offset`.
    /// Eager payloads copy straight out of the slot; long ones trigger the
    /// rendezvous get against the initiator.
    pub fn next_unexpected(
        &self,
        dst: &Arc<Buffer>,
        offset: u64,
    ) -> NntiResult<Event> {
        let tgt = self
            .unexpected_msgs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(NntiError::Noent)?;

        tgt.set_unexpected_dst(dst.clone(), offset);
        let done = tgt.update(self, &Event::noop());
        let failure = tgt.failed();

        let mut ev = self.take_event();
        ev.transport = TransportId::Sockets;
        ev.event_type = event_types::SEND;
        ev.result = Ok(());
        ev.wid = 0;
        ev.op = OpKind::Send;
        ev.peer_pid = tgt.initiator_pid();
        ev.start = dst.base();
        ev.offset = tgt.actual_offset();
        ev.length = tgt.payload_length();
        ev.context = 0;

        if done {
            self.retire_op(tgt.index());
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(ev),
        }
    }

    // -- op plumbing ---------------------------------------------------------

    fn make_cmd_op(&self, wid: Arc<WorkId>, msg: CmdMsg) -> Arc<CmdOp> {
        if let Some(arc) = self.cmd_op_fl.pop() {
            if let Ok(mut op) = Arc::try_unwrap(arc) {
                op.reset(wid, msg);
                return Arc::new(op);
            }
        }
        CmdOp::new(wid, msg)
    }

    pub(crate) fn make_cmd_tgt(&self, conn: Arc<Connection>, msg: CmdMsg) -> Arc<CmdTgt> {
        if let Some(arc) = self.cmd_tgt_fl.pop() {
            if let Ok(mut op) = Arc::try_unwrap(arc) {
                op.reset(conn, msg);
                return Arc::new(op);
            }
        }
        CmdTgt::new(conn, msg)
    }

    fn make_rdma_op(&self, kind: RdmaKind, wid: Arc<WorkId>) -> Arc<RdmaOp> {
        if let Some(arc) = self.rdma_op_fl.pop() {
            if let Ok(mut op) = Arc::try_unwrap(arc) {
                op.reset(kind, wid);
                return Arc::new(op);
            }
        }
        RdmaOp::new(kind, wid)
    }

    fn make_atomic_op(&self, wid: Arc<WorkId>) -> Arc<AtomicOp> {
        if let Some(arc) = self.atomic_op_fl.pop() {
            if let Ok(mut op) = Arc::try_unwrap(arc) {
                op.reset(wid);
                return Arc::new(op);
            }
        }
        AtomicOp::new(wid)
    }

    /// Remove a finished op from the vector, drop its wid from the map, and
    /// pool the shell for reuse.
    pub(crate) fn retire_op(&self, index: u32) {
        let removed = self.op_vector.remove(index);
        match removed {
            Some(OpRef::Cmd(op)) => {
                if let Some(w) = op.wid() {
                    self.wid_map.lock().unwrap().remove(&w.id());
                }
                self.cmd_op_fl.push(op);
            }
            Some(OpRef::Tgt(op)) => {
                self.cmd_tgt_fl.push(op);
            }
            Some(OpRef::Rdma(op)) => {
                if let Some(w) = op.wid() {
                    self.wid_map.lock().unwrap().remove(&w.id());
                }
                self.rdma_op_fl.push(op);
            }
            Some(OpRef::Atomic(op)) => {
                if let Some(w) = op.wid() {
                    self.wid_map.lock().unwrap().remove(&w.id());
                }
                self.atomic_op_fl.push(op);
            }
            None => {}
        }
    }

    // -- event delivery ------------------------------------------------------

    pub(crate) fn take_event(&self) -> Event {
        self.event_fl.pop().unwrap_or_else(Event::noop)
    }

    pub(crate) fn recycle_event(&self, ev: Event) {
        self.event_fl.push(ev);
    }

    /// Initiator-side delivery ladder: request callback, alternate queue
    /// callback, buffer queue callback, then queue the event (alternate
    /// queue preferred).
    pub(crate) fn deliver_initiator_event(&self, wr: &WorkRequest, ev: Event) {
        if wr.invoke_cb(&ev) {
            self.recycle_event(ev);
            return;
        }
        let buf_q = wr.local_hdl.as_ref().and_then(|b| b.eq().cloned());
        if let Some(q) = &wr.alt_eq {
            if q.invoke_cb(&ev) {
                self.recycle_event(ev);
                return;
            }
        }
        if let Some(q) = &buf_q {
            if q.invoke_cb(&ev) {
                self.recycle_event(ev);
                return;
            }
        }
        if let Some(q) = &wr.alt_eq {
            if q.push(ev) {
                q.notify();
            } else {
                TransportStats::bump(&self.stats.dropped_events);
            }
            return;
        }
        if let Some(q) = &buf_q {
            if q.push(ev) {
                q.notify();
            } else {
                TransportStats::bump(&self.stats.dropped_events);
            }
            return;
        }
        self.recycle_event(ev);
    }

    /// Target-side delivery ladder for a registered buffer.
    pub(crate) fn deliver_target_event(&self, buf: &Arc<Buffer>, ev: Event) {
        if buf.invoke_cb(&ev) {
            self.recycle_event(ev);
            return;
        }
        match buf.eq() {
            Some(q) => {
                if q.invoke_cb(&ev) {
                    self.recycle_event(ev);
                } else if q.push(ev) {
                    q.notify();
                } else {
                    TransportStats::bump(&self.stats.dropped_events);
                }
            }
            None => self.recycle_event(ev),
        }
    }

    // -- one-sided service ---------------------------------------------------

    pub(crate) fn wake_progress(&self) {
        let token: u32 = 1;
        unsafe {
            libc::write(
                self.wake_pipe.1,
                &token as *const u32 as *const libc::c_void,
                4,
            );
        }
    }

    pub(crate) fn wake_read_fd(&self) -> RawFd {
        self.wake_pipe.0
    }

    pub(crate) fn set_progress_tid(&self, id: thread::ThreadId) {
        *self.progress_tid.lock().unwrap() = Some(id);
    }

    fn on_progress_thread(&self) -> bool {
        *self.progress_tid.lock().unwrap() == Some(thread::current().id())
    }

    /// Post the rendezvous get for an expected long message; completion
    /// resumes the target op from the progress thread.
    pub(crate) fn post_op_get(
        &self,
        conn: &Arc<Connection>,
        op_index: u32,
        base: u64,
        offset: u64,
        length: u64,
    ) -> NntiResult<()> {
        let req = wire::GetReq { req_id: op_index, flags: 0, base, offset, length };
        conn.send_frame(tags::GET_REQ, &wire::build_get_req(&req))
    }

    /// Synchronous rendezvous get for `next_unexpected`. Off the progress
    /// thread it parks on a completion channel; on the progress thread (the
    /// unexpected-queue callback path) it pumps this connection's frames
    /// inline until the data arrives.
    pub(crate) fn blocking_long_get(
        &self,
        conn: &Arc<Connection>,
        base: u64,
        offset: u64,
        length: u64,
        dst: Arc<Buffer>,
        dst_off: u64,
    ) -> NntiResult<()> {
        if length == 0 {
            return Ok(());
        }
        let req_id =
            BLOCKING_REQ_BIT | (self.next_blocking_id.fetch_add(1, Ordering::Relaxed) & !BLOCKING_REQ_BIT);
        let req = wire::GetReq { req_id, flags: 0, base, offset, length };

        if self.on_progress_thread() {
            conn.send_frame(tags::GET_REQ, &wire::build_get_req(&req))?;
            loop {
                let frame = conn.read_frame()?;
                if frame.tag == tags::GET_RESP {
                    let (id, code, data) = wire::parse_get_resp(&frame.payload)?;
                    if id == req_id {
                        return match wire::code_to_err(code) {
                            Some(e) => Err(e),
                            None => dst.copy_in(dst_off, data).map(|_| ()),
                        };
                    }
                    self.complete_get_response(conn, id, code, data);
                } else {
                    self.dispatch_frame(conn, frame);
                }
            }
        } else {
            let (tx, rx) = mpsc::sync_channel(1);
            self.pending_blocking
                .lock()
                .unwrap()
                .insert(req_id, BlockingGet { dst, dst_off, tx });
            if let Err(e) = conn.send_frame(tags::GET_REQ, &wire::build_get_req(&req)) {
                self.pending_blocking.lock().unwrap().remove(&req_id);
                return Err(e);
            }
            match rx.recv_timeout(Duration::from_secs(30)) {
                Ok(r) => r,
                Err(_) => {
                    self.pending_blocking.lock().unwrap().remove(&req_id);
                    Err(NntiError::Timedout)
                }
            }
        }
    }

    /// Route a get response to whoever is waiting on it.
    pub(crate) fn complete_get_response(
        &self,
        _conn: &Arc<Connection>,
        req_id: u32,
        code: u8,
        data: &[u8],
    ) {
        if req_id & BLOCKING_REQ_BIT != 0 {
            let slot = self.pending_blocking.lock().unwrap().remove(&req_id);
            if let Some(bg) = slot {
                let outcome = match wire::code_to_err(code) {
                    Some(e) => Err(e),
                    None => bg.dst.copy_in(bg.dst_off, data).map(|_| ()),
                };
                let _ = bg.tx.send(outcome);
            }
            return;
        }
        match self.op_vector.get(req_id) {
            Some(OpRef::Tgt(tgt)) => {
                if tgt.complete_long_get(self, wire::code_to_err(code), data) {
                    self.retire_op(req_id);
                }
            }
            Some(OpRef::Rdma(op)) => {
                if op.complete_get(self, wire::code_to_err(code), data) {
                    self.retire_op(req_id);
                }
            }
            _ => {
                nlog_warn!("nnti", "get response for unknown op {}", req_id);
            }
        }
    }

    /// Frame dispatch shared by the progress loop and the inline pump.
    pub(crate) fn dispatch_frame(&self, conn: &Arc<Connection>, frame: wire::Frame) {
        match frame.tag {
            tags::REQUEST => {
                let msg = match CmdMsg::from_bytes(frame.payload) {
                    Ok(m) => m,
                    Err(e) => {
                        nlog_warn!("nnti", "undecodable command message: {}", e);
                        return;
                    }
                };
                let tgt = self.make_cmd_tgt(conn.clone(), msg);
                let idx = self.op_vector.add(OpRef::Tgt(tgt.clone()));
                tgt.set_index(idx);
                if tgt.update(self, &Event::noop()) {
                    self.retire_op(idx);
                }
                // slot consumed; hand the credit straight back
                let _ = conn.send_frame(tags::CREDIT, &wire::build_credit(1));
            }
            tags::CREDIT => {
                if let Ok(n) = wire::parse_credit(&frame.payload) {
                    conn.add_credits(n);
                    self.drain_waitlist(conn);
                }
            }
            tags::LONG_GET_ACK => {
                if let Ok(src_op_id) = wire::parse_long_get_ack(&frame.payload) {
                    match self.op_vector.get(src_op_id) {
                        Some(OpRef::Cmd(op)) => {
                            if op.update(self, &Event::noop()) == UPDATE_DONE {
                                self.retire_op(src_op_id);
                            }
                        }
                        _ => {
                            nlog_warn!("nnti", "rendezvous ack for unknown op {}", src_op_id);
                        }
                    }
                }
            }
            tags::GET_REQ => {
                if let Ok(req) = wire::parse_get_req(&frame.payload) {
                    self.serve_get(conn, &req);
                }
            }
            tags::GET_RESP => {
                if let Ok((id, code, data)) = wire::parse_get_resp(&frame.payload) {
                    self.complete_get_response(conn, id, code, data);
                }
            }
            tags::PUT_REQ => {
                if let Ok(req) = wire::parse_put_req(&frame.payload) {
                    self.serve_put(conn, &req);
                }
            }
            tags::PUT_ACK => {
                if let Ok((id, code)) = wire::parse_put_ack(&frame.payload) {
                    if let Some(OpRef::Rdma(op)) = self.op_vector.get(id) {
                        if op.complete_put(self, wire::code_to_err(code)) {
                            self.retire_op(id);
                        }
                    }
                }
            }
            tags::ATOMIC_REQ => {
                if let Ok(req) = wire::parse_atomic_req(&frame.payload) {
                    self.serve_atomic(conn, &req);
                }
            }
            tags::ATOMIC_RESP => {
                if let Ok((id, code, old)) = wire::parse_atomic_resp(&frame.payload) {
                    if let Some(OpRef::Atomic(op)) = self.op_vector.get(id) {
                        if op.complete(self, wire::code_to_err(code), old) {
                            self.retire_op(id);
                        }
                    }
                }
            }
            tags::GOODBYE => {
                self.drop_connection(conn);
            }
            other => {
                nlog_warn!("nnti", "unhandled frame tag {}", other);
            }
        }
    }

    /// A credit came home: resume waitlisted sends in FIFO order until the
    /// credits run out again.
    pub(crate) fn drain_waitlist(&self, conn: &Arc<Connection>) {
        let _serial = conn.drain_guard();
        while let Some(op) = conn.waitlist_pop() {
            match op.update(self, &Event::noop()) {
                UPDATE_WAITLISTED => {
                    conn.waitlist_push_front(op);
                    break;
                }
                UPDATE_DONE => {
                    let idx = op.index();
                    self.retire_op(idx);
                }
                _ => {}
            }
        }
    }

    fn serve_get(&self, conn: &Arc<Connection>, req: &wire::GetReq) {
        use crate::types::buffer_flags;
        let outcome: NntiResult<Vec<u8>> = match self.lookup_buffer(req.base) {
            None => Err(NntiError::Noent),
            Some(b) => {
                if b.flags() & buffer_flags::REMOTE_READ == 0 {
                    Err(NntiError::Perm)
                } else {
                    b.read_bytes(req.offset, req.length)
                }
            }
        };
        let resp = match &outcome {
            Ok(data) => wire::build_get_resp(req.req_id, wire::CODE_OK, data),
            Err(e) => wire::build_get_resp(req.req_id, wire::err_to_code(*e), &[]),
        };
        let _ = conn.send_frame(tags::GET_RESP, &resp);

        if outcome.is_ok() && req.flags & wire::req_flags::REMOTE_EVENT != 0 {
            if let Some(b) = self.lookup_buffer(req.base) {
                let mut ev = self.take_event();
                ev.transport = TransportId::Sockets;
                ev.event_type = event_types::GET;
                ev.result = Ok(());
                ev.wid = 0;
                ev.op = OpKind::Get;
                ev.peer_pid = conn.peer().pid();
                ev.start = b.base();
                ev.offset = req.offset;
                ev.length = req.length;
                ev.context = 0;
                self.deliver_target_event(&b, ev);
            }
        }
    }

    fn serve_put(&self, conn: &Arc<Connection>, req: &wire::PutReq<'_>) {
        use crate::types::buffer_flags;
        let mut landed_offset = req.offset;
        let outcome: NntiResult<()> = match self.lookup_buffer(req.base) {
            None => Err(NntiError::Noent),
            Some(b) => {
                if b.flags() & buffer_flags::REMOTE_WRITE == 0 {
                    Err(NntiError::Perm)
                } else {
                    b.copy_in(req.offset, req.data).map(|actual| {
                        landed_offset = actual;
                    })
                }
            }
        };

        if req.flags & wire::req_flags::WANT_ACK != 0 {
            let code = match &outcome {
                Ok(()) => wire::CODE_OK,
                Err(e) => wire::err_to_code(*e),
            };
            let _ = conn.send_frame(tags::PUT_ACK, &wire::build_put_ack(req.req_id, code));
        }

        if outcome.is_ok() && req.flags & wire::req_flags::REMOTE_EVENT != 0 {
            if let Some(b) = self.lookup_buffer(req.base) {
                let mut ev = self.take_event();
                ev.transport = TransportId::Sockets;
                ev.event_type = event_types::PUT;
                ev.result = Ok(());
                ev.wid = 0;
                ev.op = OpKind::Put;
                ev.peer_pid = conn.peer().pid();
                ev.start = b.base();
                ev.offset = landed_offset;
                ev.length = req.data.len() as u64;
                ev.context = 0;
                self.deliver_target_event(&b, ev);
            }
        }
    }

    /// Atomics execute serialized per transport, mirroring NIC-side
    /// atomicity: concurrent atomics on one region see a total order.
    fn serve_atomic(&self, conn: &Arc<Connection>, req: &wire::AtomicReq) {
        use crate::types::buffer_flags;
        let outcome: NntiResult<i64> = match self.lookup_buffer(req.base) {
            None => Err(NntiError::Noent),
            Some(b) => {
                if b.flags() & buffer_flags::REMOTE_ATOMIC == 0 {
                    Err(NntiError::Perm)
                } else {
                    let _serial = self.atomics_lock.lock().unwrap();
                    b.read_i64(req.offset).and_then(|old| {
                        let new = match req.kind {
                            wire::atomic_kind::FADD => old.wrapping_add(req.operand1),
                            wire::atomic_kind::CSWAP => {
                                if old == req.operand1 {
                                    req.operand2
                                } else {
                                    old
                                }
                            }
                            _ => return Err(NntiError::Inval),
                        };
                        b.write_i64(req.offset, new)?;
                        Ok(old)
                    })
                }
            }
        };

        let resp = match outcome {
            Ok(old) => wire::build_atomic_resp(req.req_id, wire::CODE_OK, old),
            Err(e) => wire::build_atomic_resp(req.req_id, wire::err_to_code(e), 0),
        };
        let _ = conn.send_frame(tags::ATOMIC_RESP, &resp);
    }
}

impl Drop for SocketsTransport {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_pipe.0);
            libc::close(self.wake_pipe.1);
            libc::close(self.interrupt_pipe.0);
            libc::close(self.interrupt_pipe.1);
        }
    }
}
