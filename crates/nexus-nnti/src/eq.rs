//! Event queues.
//!
//! Bounded multi-producer queues of completion events with a notification
//! pipe so waiters can block in `poll(2)` alongside other queues. A push
//! never blocks: when the queue is full the event is dropped and counted,
//! unless the queue was created to require reservations, in which case
//! producers must hold a reservation obtained up front.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::error::{NntiError, NntiResult};
use crate::types::Event;
use crate::wr::EventCallback;

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

pub struct EventQueue {
    q: ArrayQueue<Event>,
    size: u64,
    flags: u32,
    require_reservation: bool,
    outstanding: AtomicI64,
    dropped: AtomicU64,
    notify_read: RawFd,
    notify_write: RawFd,
    callback: Option<EventCallback>,
    cb_context: u64,
}

impl EventQueue {
    pub fn new(size: u64, flags: u32) -> NntiResult<Arc<EventQueue>> {
        EventQueue::build(size, flags, false, None, 0)
    }

    pub fn with_callback(
        size: u64,
        flags: u32,
        callback: EventCallback,
        cb_context: u64,
    ) -> NntiResult<Arc<EventQueue>> {
        EventQueue::build(size, flags, false, Some(callback), cb_context)
    }

    /// A queue whose producers must hold reservations; push cannot overflow.
    pub fn with_reservations(size: u64, flags: u32) -> NntiResult<Arc<EventQueue>> {
        EventQueue::build(size, flags, true, None, 0)
    }

    fn build(
        size: u64,
        flags: u32,
        require_reservation: bool,
        callback: Option<EventCallback>,
        cb_context: u64,
    ) -> NntiResult<Arc<EventQueue>> {
        if size == 0 {
            return Err(NntiError::Inval);
        }
        let (r, w) = nonblocking_pipe()?;
        Ok(Arc::new(EventQueue {
            q: ArrayQueue::new(size as usize),
            size,
            flags,
            require_reservation,
            outstanding: AtomicI64::new(0),
            dropped: AtomicU64::new(0),
            notify_read: r,
            notify_write: w,
            callback,
            cb_context,
        }))
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn requires_reservation(&self) -> bool {
        self.require_reservation
    }

    /// Claim queue space ahead of producing. False when the queue is at
    /// capacity.
    pub fn get_reservation(&self) -> bool {
        if !self.require_reservation {
            return true;
        }
        let r = self.outstanding.fetch_add(1, Ordering::SeqCst);
        if r >= self.size as i64 {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn return_reservation(&self) {
        if self.require_reservation {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Nonblocking push. A full queue drops the event (counted) — producers
    /// holding reservations never see that happen.
    pub fn push(&self, ev: Event) -> bool {
        match self.q.push(ev) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<Event> {
        let ev = self.q.pop();
        if ev.is_some() {
            self.return_reservation();
        }
        ev
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wake anyone polling [`read_fd`](Self::read_fd).
    pub fn notify(&self) {
        let token: u32 = 0xAAAA_AAAA;
        unsafe {
            libc::write(
                self.notify_write,
                &token as *const u32 as *const libc::c_void,
                4,
            );
        }
    }

    /// Pollable fd that becomes readable when events arrive.
    pub fn read_fd(&self) -> RawFd {
        self.notify_read
    }

    /// Swallow pending notification tokens (nonblocking).
    pub fn drain_notifications(&self) {
        let mut sink = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.notify_read,
                    sink.as_mut_ptr() as *mut libc::c_void,
                    sink.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Queue-level callback; false when absent or not consumed.
    pub fn invoke_cb(&self, ev: &Event) -> bool {
        match &self.callback {
            Some(cb) => cb(ev, self.cb_context),
            None => false,
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.notify_read);
            libc::close(self.notify_write);
        }
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("len", &self.q.len())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::event_types;

    fn ev() -> Event {
        let mut e = Event::noop();
        e.event_type = event_types::SEND;
        e
    }

    #[test]
    fn test_push_pop() {
        let q = EventQueue::new(4, 0).unwrap();
        assert!(q.push(ev()));
        assert!(q.push(ev()));
        assert_eq!(q.len(), 2);
        assert!(q.pop().is_some());
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let q = EventQueue::new(2, 0).unwrap();
        assert!(q.push(ev()));
        assert!(q.push(ev()));
        assert!(!q.push(ev()));
        assert_eq!(q.dropped_count(), 1);
        // draining frees space again
        q.pop();
        assert!(q.push(ev()));
    }

    #[test]
    fn test_reservations_bound_producers() {
        let q = EventQueue::with_reservations(2, 0).unwrap();
        assert!(q.get_reservation());
        assert!(q.get_reservation());
        assert!(!q.get_reservation(), "queue capacity is spoken for");
        q.push(ev());
        q.pop();
        assert!(q.get_reservation(), "pop returned a reservation");
    }

    #[test]
    fn test_notification_fd_wakes() {
        let q = EventQueue::new(4, 0).unwrap();
        q.push(ev());
        q.notify();

        let mut pfd = libc::pollfd {
            fd: q.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 1000) };
        assert_eq!(rc, 1);
        assert!(pfd.revents & libc::POLLIN != 0);

        q.drain_notifications();
        let mut pfd2 = libc::pollfd {
            fd: q.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd2, 1, 0) };
        assert_eq!(rc, 0, "drained fd is quiet");
    }

    #[test]
    fn test_callback_consumption() {
        use std::sync::atomic::AtomicUsize;
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let q = EventQueue::with_callback(
            4,
            0,
            Arc::new(move |_ev, _ctx| {
                h.fetch_add(1, Ordering::SeqCst);
                true
            }),
            0,
        )
        .unwrap();
        assert!(q.invoke_cb(&ev()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
