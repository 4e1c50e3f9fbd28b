//! The threaded dispatcher core.
//!
//! Registered as the transport's unexpected-message callback. Every update
//! for a given mailbox is queued on the backburner keyed by that mailbox,
//! which makes op execution serial and in arrival order per mailbox no
//! matter how many workers are running — the correctness property the rest
//! of the stack leans on. No cross-mailbox ordering exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Instant;

use nexus_common::backburner;
use nexus_common::error::{CommonError, CommonResult};
use nexus_common::nodeid::NodeId;
use nexus_common::{nlog_debug, nlog_warn};
use nexus_whookie::Server;

use nexus_nnti::buffer::Buffer;
use nexus_nnti::eq::EventQueue;
use nexus_nnti::error::{NntiError, NntiResult};
use nexus_nnti::nurl::TransportUrl;
use nexus_nnti::peer::Peer;
use nexus_nnti::sockets::SocketsTransport;
use nexus_nnti::types::{buffer_flags, eq_flags, Event, OpKind};
use nexus_nnti::wr::WorkRequest;

use crate::message::{Message, MAILBOX_UNSPECIFIED};
use crate::op::{Op, OpArgs, WaitingType};
use crate::registry::{OpFactory, OpRegistry};

struct ActiveOp {
    mailbox: u32,
    op: Box<dyn Op>,
    created: Instant,
    last_update: Instant,
}

pub struct OpBoxCore {
    transport: Arc<SocketsTransport>,
    whookie: Arc<Server>,
    registry: OpRegistry,
    active: RwLock<HashMap<u32, Arc<Mutex<ActiveOp>>>>,
    next_mailbox: AtomicU32,
    my_node: NodeId,
    unexpected_eq: Mutex<Option<Arc<EventQueue>>>,
    send_eq: Arc<EventQueue>,
    send_bufs: Mutex<HashMap<u32, Arc<Buffer>>>,
    drainer: Mutex<Option<thread::JoinHandle<()>>>,
    shutdown: AtomicBool,
}

fn send_buf_flags() -> u32 {
    // REMOTE_READ so a long message's rendezvous get may read the staging
    // buffer
    buffer_flags::LOCAL_READ | buffer_flags::LOCAL_WRITE | buffer_flags::REMOTE_READ
}

impl OpBoxCore {
    /// Stand the dispatcher up on a started transport: claims the
    /// transport's unexpected queue, spawns the send-completion drainer and
    /// installs the status hooks.
    pub fn init(
        transport: Arc<SocketsTransport>,
        whookie: Arc<Server>,
    ) -> CommonResult<Arc<OpBoxCore>> {
        let url_s = transport.get_url().map_err(|e| CommonError::ComponentInit {
            component: "opbox".to_string(),
            detail: e.to_string(),
        })?;
        let url = TransportUrl::parse(&url_s).map_err(|e| CommonError::ComponentInit {
            component: "opbox".to_string(),
            detail: e.to_string(),
        })?;
        let my_node = NodeId::new(
            url.ip().map_err(|_| CommonError::BadUrl(url_s.clone()))?,
            url.port(),
        );

        let send_eq = transport
            .eq_create(1024, 0)
            .map_err(|e| CommonError::ComponentInit {
                component: "opbox".to_string(),
                detail: e.to_string(),
            })?;

        let core = Arc::new(OpBoxCore {
            transport: transport.clone(),
            whookie,
            registry: OpRegistry::new(),
            active: RwLock::new(HashMap::new()),
            next_mailbox: AtomicU32::new(1),
            my_node,
            unexpected_eq: Mutex::new(None),
            send_eq,
            send_bufs: Mutex::new(HashMap::new()),
            drainer: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });

        // inbound path: we are the transport's unexpected consumer
        let c = core.clone();
        let ueq = transport
            .eq_create_with_callback(
                1024,
                eq_flags::UNEXPECTED,
                Arc::new(move |ev: &Event, _ctx| {
                    c.handle_unexpected_event(ev);
                    true
                }),
                0,
            )
            .map_err(|e| CommonError::ComponentInit {
                component: "opbox".to_string(),
                detail: e.to_string(),
            })?;
        *core.unexpected_eq.lock().unwrap() = Some(ueq);

        // outbound path: free staging buffers as their sends complete
        let c = core.clone();
        let handle = thread::Builder::new()
            .name("opbox-send-drain".to_string())
            .spawn(move || c.drain_send_completions())
            .expect("failed to spawn opbox send drainer");
        *core.drainer.lock().unwrap() = Some(handle);

        core.install_hooks();
        Ok(core)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.drainer.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(eq) = self.unexpected_eq.lock().unwrap().take() {
            self.transport.eq_destroy(&eq);
        }
        self.whookie.deregister_hook("/opbox");
        self.whookie.deregister_hook("/opbox/ops");
        for (_, b) in self.send_bufs.lock().unwrap().drain() {
            let _ = self.transport.free(&b);
        }
        self.active.write().unwrap().clear();
        self.registry.clear();
    }

    pub fn my_node(&self) -> NodeId {
        self.my_node
    }

    pub fn transport(&self) -> &Arc<SocketsTransport> {
        &self.transport
    }

    pub fn whookie(&self) -> &Arc<Server> {
        &self.whookie
    }

    // -- op registry ---------------------------------------------------------

    pub fn register_op(&self, op_id: u32, op_name: &str, factory: OpFactory) -> CommonResult<()> {
        self.registry.register(op_id, op_name, factory)
    }

    pub fn deregister_op(&self, op_id: u32) {
        self.registry.deregister(op_id);
    }

    pub fn known_ops(&self) -> Vec<(u32, String)> {
        self.registry.known_ops()
    }

    // -- dispatch ------------------------------------------------------------

    fn alloc_mailbox(&self) -> u32 {
        loop {
            let mb = self.next_mailbox.fetch_add(1, Ordering::Relaxed);
            if mb != MAILBOX_UNSPECIFIED {
                return mb;
            }
        }
    }

    /// Launch a locally created op. Ownership transfers to the dispatcher;
    /// the start update runs on the mailbox's worker.
    pub fn launch_op(self: &Arc<Self>, op: Box<dyn Op>) -> u32 {
        let mailbox = self.alloc_mailbox();
        let entry = Arc::new(Mutex::new(ActiveOp {
            mailbox,
            op,
            created: Instant::now(),
            last_update: Instant::now(),
        }));
        self.active.write().unwrap().insert(mailbox, entry);

        let core = self.clone();
        backburner::add_work(mailbox, Box::new(move || {
            let mut args = OpArgs::start(core.clone());
            core.do_action(mailbox, &mut args);
        }));
        mailbox
    }

    /// Hand a user update to an op.
    pub fn trigger_op(self: &Arc<Self>, mailbox: u32) -> NntiResult<()> {
        if !self.active.read().unwrap().contains_key(&mailbox) {
            return Err(NntiError::Noent);
        }
        let core = self.clone();
        backburner::add_work(mailbox, Box::new(move || {
            let mut args = OpArgs::trigger(core.clone());
            core.do_action(mailbox, &mut args);
        }));
        Ok(())
    }

    pub fn active_op_count(&self) -> usize {
        self.active.read().unwrap().len()
    }

    /// Inbound message: spin up a target op (mailbox zero) or route to the
    /// live op. Unknown op ids and dead mailboxes are protocol corruption
    /// and abort with a diagnostic listing what this node knows.
    fn handle_incoming(self: &Arc<Self>, peer_pid: u64, msg: Message) {
        let mailbox = if msg.dst_mailbox == MAILBOX_UNSPECIFIED {
            let op = match self.registry.create(msg.op_id) {
                Some(op) => op,
                None => {
                    eprintln!(
                        "fatal: inbound message names unknown op id {:#x}; known ops:\n{}",
                        msg.op_id,
                        self.registry.listing()
                    );
                    std::process::abort();
                }
            };
            let mailbox = self.alloc_mailbox();
            let entry = Arc::new(Mutex::new(ActiveOp {
                mailbox,
                op,
                created: Instant::now(),
                last_update: Instant::now(),
            }));
            self.active.write().unwrap().insert(mailbox, entry);
            nlog_debug!("opbox", "new target op {:#x} on mailbox {}", msg.op_id, mailbox);
            mailbox
        } else {
            if !self.active.read().unwrap().contains_key(&msg.dst_mailbox) {
                eprintln!(
                    "fatal: inbound message for mailbox {} which is not active",
                    msg.dst_mailbox
                );
                std::process::abort();
            }
            msg.dst_mailbox
        };

        let core = self.clone();
        backburner::add_work(mailbox, Box::new(move || {
            let mut args = OpArgs::incoming(core.clone(), peer_pid, msg);
            core.do_action(mailbox, &mut args);
        }));
    }

    /// Run one update on the mailbox's worker and deal with the outcome.
    fn do_action(self: &Arc<Self>, mailbox: u32, args: &mut OpArgs) {
        let entry = self.active.read().unwrap().get(&mailbox).cloned();
        let entry = match entry {
            Some(e) => e,
            None => {
                nlog_debug!("opbox", "update for mailbox {} after completion", mailbox);
                args.result = -1;
                return;
            }
        };

        args.mailbox = mailbox;
        let rc = {
            let mut g = entry.lock().unwrap();
            g.last_update = Instant::now();
            g.op.update(args)
        };

        match rc {
            WaitingType::DoneAndDestroy => {
                self.active.write().unwrap().remove(&mailbox);
            }
            WaitingType::Error => {
                eprintln!("fatal: op on mailbox {} reported an error", mailbox);
                std::process::exit(-1);
            }
            WaitingType::WaitingOnMessage | WaitingType::WaitingOnTimer => {}
        }
    }

    // -- transport glue ------------------------------------------------------

    /// Runs on the transport's progress thread for each unexpected arrival:
    /// retrieve, decode, dispatch.
    fn handle_unexpected_event(self: &Arc<Self>, ev: &Event) {
        let len = ev.length.max(crate::message::MSG_HEADER_LEN as u64);
        let scratch = match self.transport.alloc(len, send_buf_flags(), None, None, 0) {
            Ok(b) => b,
            Err(e) => {
                nlog_warn!("opbox", "could not stage inbound message: {}", e);
                return;
            }
        };
        let retrieved = self.transport.next_unexpected(&scratch, 0);
        match retrieved {
            Ok(rev) => {
                let raw = scratch.read_bytes(rev.offset, rev.length).unwrap_or_default();
                let _ = self.transport.free(&scratch);
                match Message::unpack(&raw) {
                    Ok(msg) => self.handle_incoming(rev.peer_pid, msg),
                    Err(e) => nlog_warn!("opbox", "undecodable dispatcher message: {}", e),
                }
            }
            Err(e) => {
                let _ = self.transport.free(&scratch);
                nlog_warn!("opbox", "unexpected retrieval failed: {}", e);
            }
        }
    }

    pub fn peer_for_node(self: &Arc<Self>, node: NodeId) -> NntiResult<Arc<Peer>> {
        let url = TransportUrl::from_node_id(node).url_string();
        self.transport.connect(&url, 2000)
    }

    /// Send a dispatcher message to a node's dispatcher.
    pub fn send_message(self: &Arc<Self>, node: NodeId, msg: &Message) -> NntiResult<u32> {
        let peer = self.peer_for_node(node)?;
        self.send_message_peer(&peer, msg)
    }

    pub fn send_message_peer(self: &Arc<Self>, peer: &Arc<Peer>, msg: &Message) -> NntiResult<u32> {
        let raw = msg.pack();
        let buf = self
            .transport
            .alloc(raw.len() as u64, send_buf_flags(), None, None, 0)?;
        buf.copy_in(0, &raw)?;
        let wr = WorkRequest {
            op: OpKind::Send,
            peer: Some(peer.clone()),
            local_hdl: Some(buf.clone()),
            length: raw.len() as u64,
            alt_eq: Some(self.send_eq.clone()),
            ..Default::default()
        };
        let wid = self.transport.send(&wr)?;
        self.send_bufs.lock().unwrap().insert(wid, buf);
        Ok(wid)
    }

    fn drain_send_completions(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match self.transport.eq_wait(&[self.send_eq.clone()], 250) {
                Ok((_, ev)) => {
                    let buf = self.send_bufs.lock().unwrap().remove(&ev.wid);
                    if let Some(b) = buf {
                        let _ = self.transport.free(&b);
                    }
                }
                Err(NntiError::Timedout) | Err(NntiError::Intr) => continue,
                Err(_) => break,
            }
        }
    }

    // -- introspection -------------------------------------------------------

    fn install_hooks(self: &Arc<Self>) {
        let c = self.clone();
        self.whookie.update_hook("/opbox", Arc::new(move |_args, rs| {
            rs.table_begin("OpBox Status");
            rs.table_top(&["Parameter", "Setting"]);
            rs.table_row(&["Core Type".to_string(), "threaded".to_string()]);
            rs.table_row(&["Active Ops".to_string(), c.active_op_count().to_string()]);
            rs.table_end();

            rs.table_begin("Registered Ops");
            rs.table_top(&["Id", "Name"]);
            for (id, name) in c.known_ops() {
                rs.table_row(&[format!("{:#010x}", id), name]);
            }
            rs.table_end();
            rs.finish();
        }));

        let c = self.clone();
        self.whookie.update_hook("/opbox/ops", Arc::new(move |_args, rs| {
            rs.table_begin("OpBox Active Ops");
            rs.table_top(&["Mailbox", "Name", "State", "Alive(s)", "LastUpdate(s)"]);
            let entries: Vec<Arc<Mutex<ActiveOp>>> =
                c.active.read().unwrap().values().cloned().collect();
            for e in entries {
                let g = e.lock().unwrap();
                rs.table_row(&[
                    g.mailbox.to_string(),
                    g.op.op_name().to_string(),
                    g.op.state_name(),
                    g.created.elapsed().as_secs().to_string(),
                    g.last_update.elapsed().as_secs().to_string(),
                ]);
            }
            rs.table_end();
            rs.finish();
        }));
    }
}
