//! Indexed slot vectors.
//!
//! Live ops and connections get a small integer index that rides in the
//! wire's 32-bit instance-id field, so inbound completions resolve their
//! owner in O(1) without a hash lookup. Freed slots are reused from the
//! lowest available index; the backing storage grows by half when full.

use std::sync::Mutex;

struct Inner<T> {
    slots: Vec<Option<T>>,
    lowest_avail: usize,
}

pub struct IndexVector<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> IndexVector<T> {
    pub fn new(initial: usize) -> IndexVector<T> {
        let initial = initial.max(1);
        IndexVector {
            inner: Mutex::new(Inner {
                slots: vec![None; initial],
                lowest_avail: 0,
            }),
        }
    }

    /// Store `t`, returning its slot index.
    pub fn add(&self, t: T) -> u32 {
        let mut g = self.inner.lock().unwrap();
        let index = g.lowest_avail;
        g.slots[index] = Some(t);

        // find the next free slot
        let mut next = None;
        for i in index + 1..g.slots.len() {
            if g.slots[i].is_none() {
                next = Some(i);
                break;
            }
        }
        match next {
            Some(i) => g.lowest_avail = i,
            None => {
                // full: grow by half
                let old = g.slots.len();
                let grown = old + (old / 2).max(1);
                g.slots.resize(grown, None);
                g.lowest_avail = old;
            }
        }

        index as u32
    }

    /// Clear a slot, returning its occupant.
    pub fn remove(&self, index: u32) -> Option<T> {
        let mut g = self.inner.lock().unwrap();
        let index = index as usize;
        if index >= g.slots.len() {
            return None;
        }
        let t = g.slots[index].take();
        if t.is_some() && index < g.lowest_avail {
            g.lowest_avail = index;
        }
        t
    }

    pub fn get(&self, index: u32) -> Option<T> {
        let g = self.inner.lock().unwrap();
        g.slots.get(index as usize).and_then(|s| s.clone())
    }

    /// Snapshot of every occupied slot.
    pub fn snapshot(&self) -> Vec<(u32, T)> {
        let g = self.inner.lock().unwrap();
        g.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.clone().map(|t| (i as u32, t)))
            .collect()
    }

    pub fn occupied(&self) -> usize {
        let g = self.inner.lock().unwrap();
        g.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let v: IndexVector<u64> = IndexVector::new(4);
        let a = v.add(100);
        let b = v.add(200);
        assert_eq!(v.get(a), Some(100));
        assert_eq!(v.get(b), Some(200));
        assert_eq!(v.remove(a), Some(100));
        assert_eq!(v.get(a), None);
        assert_eq!(v.remove(a), None);
    }

    #[test]
    fn test_lowest_index_reuse() {
        let v: IndexVector<u32> = IndexVector::new(8);
        let a = v.add(1);
        let _b = v.add(2);
        let _c = v.add(3);
        v.remove(a);
        let d = v.add(4);
        assert_eq!(d, a, "freed lowest slot is reused first");
    }

    #[test]
    fn test_growth_past_initial_capacity() {
        let v: IndexVector<usize> = IndexVector::new(2);
        let mut indices = Vec::new();
        for i in 0..100 {
            indices.push(v.add(i));
        }
        for (i, idx) in indices.iter().enumerate() {
            assert_eq!(v.get(*idx), Some(i));
        }
        assert_eq!(v.occupied(), 100);
    }

    #[test]
    fn test_live_slot_stays_pinned() {
        let v: IndexVector<String> = IndexVector::new(2);
        let a = v.add("keep".to_string());
        for i in 0..50 {
            let idx = v.add(format!("x{}", i));
            v.remove(idx);
        }
        assert_eq!(v.get(a), Some("keep".to_string()));
    }

    #[test]
    fn test_concurrent_adds_unique_indices() {
        use std::sync::Arc;
        let v: Arc<IndexVector<u32>> = Arc::new(IndexVector::new(4));
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let v = v.clone();
            handles.push(std::thread::spawn(move || {
                (0..250).map(|i| v.add(t * 1000 + i)).collect::<Vec<u32>>()
            }));
        }
        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000, "indices are unique while slots are live");
    }
}
