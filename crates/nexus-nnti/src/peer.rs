//! Transport-scoped peer handles.
//!
//! A peer owns its identifying data (pid + url). Its connection, when one
//! exists, is referenced by index into the connection vector rather than by
//! pointer, so deleting a connection can never leave a dangling peer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::nurl::TransportUrl;

/// Sentinel for "no connection".
pub const CONN_NONE: u32 = u32::MAX;

#[derive(Debug)]
pub struct Peer {
    pid: u64,
    url: TransportUrl,
    conn_index: AtomicU32,
}

impl Peer {
    pub fn new(url: TransportUrl) -> Arc<Peer> {
        Arc::new(Peer {
            pid: url.pid(),
            url,
            conn_index: AtomicU32::new(CONN_NONE),
        })
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn url(&self) -> &TransportUrl {
        &self.url
    }

    pub fn conn_index(&self) -> Option<u32> {
        match self.conn_index.load(Ordering::Acquire) {
            CONN_NONE => None,
            i => Some(i),
        }
    }

    pub fn set_conn_index(&self, index: u32) {
        self.conn_index.store(index, Ordering::Release);
    }

    pub fn clear_conn_index(&self) {
        self.conn_index.store(CONN_NONE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_identity() {
        let url = TransportUrl::parse("sockets://127.0.0.1:2020").unwrap();
        let p = Peer::new(url.clone());
        assert_eq!(p.pid(), url.pid());
        assert_eq!(p.conn_index(), None);
        p.set_conn_index(7);
        assert_eq!(p.conn_index(), Some(7));
        p.clear_conn_index();
        assert_eq!(p.conn_index(), None);
    }
}
