//! Per-transport counters, surfaced on the stats hook.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct TransportStats {
    pub short_sends: AtomicU64,
    pub long_sends: AtomicU64,
    pub unexpected_sends: AtomicU64,
    pub short_recvs: AtomicU64,
    pub long_recvs: AtomicU64,
    pub unexpected_recvs: AtomicU64,
    pub dropped_unexpected: AtomicU64,
    pub dropped_events: AtomicU64,
    /// Bytes moved by rendezvous gets (the aligned middle only).
    pub long_get_bytes: AtomicU64,
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    pub atomics: AtomicU64,
}

impl TransportStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let g = |c: &AtomicU64| c.load(Ordering::Relaxed);
        vec![
            ("short_sends", g(&self.short_sends)),
            ("long_sends", g(&self.long_sends)),
            ("unexpected_sends", g(&self.unexpected_sends)),
            ("short_recvs", g(&self.short_recvs)),
            ("long_recvs", g(&self.long_recvs)),
            ("unexpected_recvs", g(&self.unexpected_recvs)),
            ("dropped_unexpected", g(&self.dropped_unexpected)),
            ("dropped_events", g(&self.dropped_events)),
            ("long_get_bytes", g(&self.long_get_bytes)),
            ("puts", g(&self.puts)),
            ("gets", g(&self.gets)),
            ("atomics", g(&self.atomics)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_bumps() {
        let s = TransportStats::default();
        TransportStats::bump(&s.short_sends);
        TransportStats::bump(&s.short_sends);
        TransportStats::add(&s.long_get_bytes, 996);
        let snap = s.snapshot();
        assert!(snap.contains(&("short_sends", 2)));
        assert!(snap.contains(&("long_get_bytes", 996)));
    }
}
