//! Work ids.
//!
//! The transport assigns each submitted request a monotonically increasing
//! 32-bit id and keeps its own copy of the work request inside it. The copy
//! lives for the whole operation; completion and cancellation state hang off
//! it so `wait` and late events can be reconciled.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{NntiError, NntiResult};
use crate::wr::WorkRequest;

static NEXT_WID: AtomicU32 = AtomicU32::new(1);

pub struct WorkId {
    id: u32,
    wr: WorkRequest,
    complete: Mutex<bool>,
    complete_cv: Condvar,
    cancelled: AtomicBool,
}

impl WorkId {
    pub fn new(wr: WorkRequest) -> Arc<WorkId> {
        Arc::new(WorkId {
            id: NEXT_WID.fetch_add(1, Ordering::Relaxed),
            wr,
            complete: Mutex::new(false),
            complete_cv: Condvar::new(),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn wr(&self) -> &WorkRequest {
        &self.wr
    }

    pub fn is_complete(&self) -> bool {
        *self.complete.lock().unwrap()
    }

    pub fn mark_complete(&self) {
        let mut done = self.complete.lock().unwrap();
        *done = true;
        self.complete_cv.notify_all();
    }

    /// Block until the operation completes.
    pub fn wait(&self, timeout: Duration) -> NntiResult<()> {
        let guard = self.complete.lock().unwrap();
        let (guard, res) = self
            .complete_cv
            .wait_timeout_while(guard, timeout, |done| !*done)
            .map_err(|_| NntiError::Io)?;
        drop(guard);
        if res.timed_out() {
            Err(NntiError::Timedout)
        } else {
            Ok(())
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_increase() {
        let a = WorkId::new(WorkRequest::default());
        let b = WorkId::new(WorkRequest::default());
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_wait_sees_completion() {
        let w = WorkId::new(WorkRequest::default());
        let w2 = w.clone();
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            w2.mark_complete();
        });
        w.wait(Duration::from_secs(2)).unwrap();
        assert!(w.is_complete());
        h.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let w = WorkId::new(WorkRequest::default());
        assert_eq!(w.wait(Duration::from_millis(10)), Err(NntiError::Timedout));
    }

    #[test]
    fn test_cancel_flag() {
        let w = WorkId::new(WorkRequest::default());
        assert!(!w.is_cancelled());
        w.cancel();
        assert!(w.is_cancelled());
    }
}
