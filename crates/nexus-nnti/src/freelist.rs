//! Bounded object pools.
//!
//! A freelist keeps recently finished objects for reuse so the hot path
//! allocates only on a miss. Return always succeeds from the caller's view:
//! pushing to a full list just drops the object.

use crossbeam_queue::ArrayQueue;

pub struct Freelist<T> {
    pool: ArrayQueue<T>,
}

impl<T> Freelist<T> {
    pub fn new(size: usize) -> Freelist<T> {
        Freelist { pool: ArrayQueue::new(size.max(1)) }
    }

    /// A recycled object, or None when the caller should allocate fresh.
    pub fn pop(&self) -> Option<T> {
        self.pool.pop()
    }

    /// Return an object; a full pool deletes it.
    pub fn push(&self, t: T) {
        let _ = self.pool.push(t);
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }
}
