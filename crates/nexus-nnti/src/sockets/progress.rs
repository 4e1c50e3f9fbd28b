//! The progress thread.
//!
//! One dedicated OS thread per transport owns every socket read. It blocks
//! in `poll(2)` over the data listener, the wake pipe, and each connection,
//! then drains whatever became ready: inbound handshakes, command frames,
//! credits, acks, and one-sided service requests. User threads never read
//! sockets; they post work and get woken through event-queue pipes.

use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use nexus_common::{nlog_debug, nlog_warn};

use crate::sockets::wire::{self, tags};
use crate::sockets::SocketsTransport;

/// Poll tick; also bounds how fast shutdown is noticed.
const POLL_TICK_MS: i32 = 200;

pub(crate) fn run(t: Arc<SocketsTransport>, listener: TcpListener) {
    t.set_progress_tid(std::thread::current().id());
    let listener_fd = listener.as_raw_fd();
    nlog_debug!("nnti", "progress thread running");

    loop {
        if t.is_shutdown() {
            break;
        }

        let conns = t.conn_poll_snapshot();
        let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(2 + conns.len());
        pfds.push(libc::pollfd { fd: listener_fd, events: libc::POLLIN, revents: 0 });
        pfds.push(libc::pollfd { fd: t.wake_read_fd(), events: libc::POLLIN, revents: 0 });
        for (fd, _) in &conns {
            pfds.push(libc::pollfd { fd: *fd, events: libc::POLLIN, revents: 0 });
        }

        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, POLL_TICK_MS) };
        if rc < 0 {
            let errno = nexus_common::error::last_errno();
            if errno == libc::EINTR {
                continue;
            }
            nlog_warn!("nnti", "progress poll failed: errno {}", errno);
            break;
        }
        if t.is_shutdown() {
            break;
        }
        if rc == 0 {
            continue;
        }

        if pfds[1].revents & libc::POLLIN != 0 {
            super::drain_fd(t.wake_read_fd());
        }

        if pfds[0].revents & libc::POLLIN != 0 {
            accept_inbound(&t, &listener);
        }

        for (i, (_, conn)) in conns.iter().enumerate() {
            let revents = pfds[2 + i].revents;
            if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) == 0 {
                continue;
            }
            match conn.read_frame() {
                Ok(frame) => t.dispatch_frame(conn, frame),
                Err(_) => {
                    nlog_debug!("nnti", "connection {} read failed, dropping", conn.index());
                    t.drop_connection(conn);
                }
            }
        }
    }

    nlog_debug!("nnti", "progress thread exiting");
}

/// A peer dialed our data port: the hello frame names the half-open
/// connection record its rendezvous created, and the stream attaches there.
fn accept_inbound(t: &Arc<SocketsTransport>, listener: &TcpListener) {
    let (mut stream, addr) = match listener.accept() {
        Ok(pair) => pair,
        Err(_) => return,
    };
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));

    let frame = match wire::read_frame(&mut stream) {
        Ok(f) => f,
        Err(e) => {
            nlog_warn!("nnti", "inbound stream from {} sent no hello: {}", addr, e);
            return;
        }
    };
    if frame.tag != tags::HELLO {
        nlog_warn!("nnti", "inbound stream from {} opened with tag {}", addr, frame.tag);
        return;
    }
    let (conn_index, pid, url) = match wire::parse_hello(&frame.payload) {
        Ok(h) => h,
        Err(_) => return,
    };

    match t.conn_by_index(conn_index) {
        Some(conn) if conn.peer().pid() == pid => {
            let _ = stream.set_read_timeout(None);
            if conn.attach_stream(stream).is_ok() {
                nlog_debug!("nnti", "accepted {} as connection {}", url, conn_index);
            }
        }
        _ => {
            nlog_warn!(
                "nnti",
                "hello names unknown connection {} (pid {:#x}); dropping stream",
                conn_index,
                pid
            );
        }
    }
}
