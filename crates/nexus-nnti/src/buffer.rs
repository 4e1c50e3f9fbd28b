//! Registered memory regions.
//!
//! A buffer is an rdma-addressable region with permission flags, an optional
//! delivery queue and callback, and a stable base address that keys the
//! per-transport buffer map. `alloc` owns its storage (8-byte aligned so
//! rendezvous alignment padding is exercised deterministically);
//! `register` wraps caller memory, which must outlive the registration.
//!
//! Remote descriptors (built by unpacking a wire form) carry a base address
//! in another process; they are never dereferenced locally.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{NntiError, NntiResult};
use crate::eq::EventQueue;
use crate::types::{buffer_flags, Event};
use crate::wr::EventCallback;

pub struct Buffer {
    base: u64,
    length: u64,
    flags: u32,
    eq: Option<Arc<EventQueue>>,
    callback: Option<EventCallback>,
    cb_context: u64,
    /// Sends into a QUEUING buffer land back-to-back; this is the cursor.
    queuing_offset: AtomicU64,
    remote: bool,
    // Keeps transport-allocated storage alive. u64 words give the payload
    // 8-byte alignment.
    _backing: Option<Box<[u64]>>,
}

// Safety: the raw base pointer is either owned backing storage, caller
// memory the caller promised to keep alive until unregister, or a remote
// address that is never dereferenced here. All mutation goes through
// copy_in/copy_out with bounds checks; concurrent writers to overlapping
// ranges are the caller's contract, as with any rdma-visible memory.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocate and register transport-owned storage.
    pub fn alloc(
        size: u64,
        flags: u32,
        eq: Option<Arc<EventQueue>>,
        callback: Option<EventCallback>,
        cb_context: u64,
    ) -> NntiResult<Arc<Buffer>> {
        if size == 0 {
            return Err(NntiError::Inval);
        }
        let words = ((size + 7) / 8) as usize;
        let backing = vec![0u64; words].into_boxed_slice();
        let base = backing.as_ptr() as u64;
        Ok(Arc::new(Buffer {
            base,
            length: size,
            flags,
            eq,
            callback,
            cb_context,
            queuing_offset: AtomicU64::new(0),
            remote: false,
            _backing: Some(backing),
        }))
    }

    /// Register caller-owned memory. The caller keeps ownership and must not
    /// free it until the registration is gone.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `size` bytes that stay valid and
    /// writable for the lifetime of the returned buffer.
    pub unsafe fn register(
        ptr: *mut u8,
        size: u64,
        flags: u32,
        eq: Option<Arc<EventQueue>>,
        callback: Option<EventCallback>,
        cb_context: u64,
    ) -> NntiResult<Arc<Buffer>> {
        if ptr.is_null() || size == 0 {
            return Err(NntiError::Inval);
        }
        Ok(Arc::new(Buffer {
            base: ptr as u64,
            length: size,
            flags,
            eq,
            callback,
            cb_context,
            queuing_offset: AtomicU64::new(0),
            remote: false,
            _backing: None,
        }))
    }

    /// Descriptor of a peer's region, reconstructed from its wire form.
    pub fn remote_descriptor(base: u64, length: u64) -> Arc<Buffer> {
        Arc::new(Buffer {
            base,
            length,
            flags: buffer_flags::REMOTE_READ | buffer_flags::REMOTE_WRITE,
            eq: None,
            callback: None,
            cb_context: 0,
            queuing_offset: AtomicU64::new(0),
            remote: true,
            _backing: None,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn eq(&self) -> Option<&Arc<EventQueue>> {
        self.eq.as_ref()
    }

    pub fn cb_context(&self) -> u64 {
        self.cb_context
    }

    /// Buffer-level callback; false when absent or not consumed.
    pub fn invoke_cb(&self, ev: &Event) -> bool {
        match &self.callback {
            Some(cb) => cb(ev, self.cb_context),
            None => false,
        }
    }

    /// Copy `src` into the region. Returns the offset actually used, which
    /// differs from `offset` for QUEUING buffers.
    pub fn copy_in(&self, offset: u64, src: &[u8]) -> NntiResult<u64> {
        if self.remote {
            return Err(NntiError::Perm);
        }
        let len = src.len() as u64;
        let actual = if self.flags & buffer_flags::QUEUING != 0 {
            self.queuing_offset.fetch_add(len, Ordering::SeqCst)
        } else {
            offset
        };
        if actual.checked_add(len).map(|end| end > self.length).unwrap_or(true) {
            return Err(NntiError::Nomem);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                (self.base + actual) as *mut u8,
                src.len(),
            );
        }
        Ok(actual)
    }

    /// Copy out of the region into `dst`.
    pub fn copy_out(&self, offset: u64, dst: &mut [u8]) -> NntiResult<()> {
        if self.remote {
            return Err(NntiError::Perm);
        }
        let len = dst.len() as u64;
        if offset.checked_add(len).map(|end| end > self.length).unwrap_or(true) {
            return Err(NntiError::Inval);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                (self.base + offset) as *const u8,
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    pub fn read_bytes(&self, offset: u64, len: u64) -> NntiResult<Vec<u8>> {
        let mut out = vec![0u8; len as usize];
        self.copy_out(offset, &mut out)?;
        Ok(out)
    }

    /// 8-byte read for the atomic service path. The caller serializes.
    pub fn read_i64(&self, offset: u64) -> NntiResult<i64> {
        let mut raw = [0u8; 8];
        self.copy_out(offset, &mut raw)?;
        Ok(i64::from_le_bytes(raw))
    }

    /// 8-byte write for the atomic service path. The caller serializes.
    pub fn write_i64(&self, offset: u64, value: i64) -> NntiResult<()> {
        self.copy_in(offset, &value.to_le_bytes()).map(|_| ())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("base", &format_args!("{:#x}", self.base))
            .field("length", &self.length)
            .field("flags", &self.flags)
            .field("remote", &self.remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::buffer_flags as bf;

    fn rw_flags() -> u32 {
        bf::LOCAL_READ | bf::LOCAL_WRITE | bf::REMOTE_READ | bf::REMOTE_WRITE
    }

    #[test]
    fn test_alloc_copy_round_trip() {
        let b = Buffer::alloc(64, rw_flags(), None, None, 0).unwrap();
        assert_eq!(b.length(), 64);
        assert_ne!(b.base(), 0);
        assert_eq!(b.base() % 8, 0, "allocations are 8-byte aligned");

        b.copy_in(5, b"hello").unwrap();
        assert_eq!(b.read_bytes(5, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_bounds_checks() {
        let b = Buffer::alloc(16, rw_flags(), None, None, 0).unwrap();
        assert_eq!(b.copy_in(12, b"hello"), Err(NntiError::Nomem));
        let mut out = [0u8; 8];
        assert_eq!(b.copy_out(12, &mut out), Err(NntiError::Inval));
        // exactly filling the region is fine
        assert!(b.copy_in(11, b"hello").is_ok());
    }

    #[test]
    fn test_queuing_offsets_accumulate() {
        let b = Buffer::alloc(64, rw_flags() | bf::QUEUING, None, None, 0).unwrap();
        assert_eq!(b.copy_in(0, b"aaaa").unwrap(), 0);
        assert_eq!(b.copy_in(0, b"bbbb").unwrap(), 4);
        assert_eq!(b.copy_in(0, b"cc").unwrap(), 8);
        assert_eq!(b.read_bytes(0, 10).unwrap(), b"aaaabbbbcc");
    }

    #[test]
    fn test_register_wraps_caller_memory() {
        let mut storage = vec![0u8; 32];
        let b = unsafe {
            Buffer::register(storage.as_mut_ptr(), 32, rw_flags(), None, None, 0)
        }
        .unwrap();
        b.copy_in(0, b"abc").unwrap();
        drop(b);
        assert_eq!(&storage[..3], b"abc");
    }

    #[test]
    fn test_remote_descriptor_is_inert() {
        let b = Buffer::remote_descriptor(0xdead_beef, 128);
        assert!(b.is_remote());
        assert_eq!(b.copy_in(0, b"x"), Err(NntiError::Perm));
    }

    #[test]
    fn test_atomic_word_io() {
        let b = Buffer::alloc(16, rw_flags() | bf::REMOTE_ATOMIC, None, None, 0).unwrap();
        b.write_i64(8, -42).unwrap();
        assert_eq!(b.read_i64(8).unwrap(), -42);
    }
}
