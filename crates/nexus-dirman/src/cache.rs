//! Directory caches.
//!
//! A cache maps a resource's `/path/name` to its membership record. All
//! mutation runs under the cache mutex so join/leave are atomic with
//! respect to concurrent lookups.

use std::collections::HashMap;
use std::sync::Mutex;

use nexus_common::dirinfo::DirectoryInfo;
use nexus_common::url::ResourceUrl;

#[derive(Default)]
pub struct DirectoryCache {
    entries: Mutex<HashMap<String, DirectoryInfo>>,
}

impl DirectoryCache {
    pub fn new() -> DirectoryCache {
        DirectoryCache { entries: Mutex::new(HashMap::new()) }
    }

    /// Insert a new record; false when the path already exists.
    pub fn create(&self, di: DirectoryInfo) -> bool {
        let mut g = self.entries.lock().unwrap();
        let key = di.url.path_name();
        if g.contains_key(&key) {
            return false;
        }
        g.insert(key, di);
        true
    }

    /// Insert or replace.
    pub fn upsert(&self, di: DirectoryInfo) {
        let mut g = self.entries.lock().unwrap();
        g.insert(di.url.path_name(), di);
    }

    pub fn get(&self, url: &ResourceUrl) -> Option<DirectoryInfo> {
        let g = self.entries.lock().unwrap();
        g.get(&url.path_name()).cloned()
    }

    pub fn contains(&self, url: &ResourceUrl) -> bool {
        let g = self.entries.lock().unwrap();
        g.contains_key(&url.path_name())
    }

    /// Mutate a record in place under the cache lock; None when absent.
    pub fn modify<R>(&self, url: &ResourceUrl, f: impl FnOnce(&mut DirectoryInfo) -> R) -> Option<R> {
        let mut g = self.entries.lock().unwrap();
        g.get_mut(&url.path_name()).map(f)
    }

    pub fn remove(&self, url: &ResourceUrl) -> Option<DirectoryInfo> {
        let mut g = self.entries.lock().unwrap();
        g.remove(&url.path_name())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let g = self.entries.lock().unwrap();
        let mut v: Vec<String> = g.keys().cloned().collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_common::nodeid::NodeId;
    use std::net::Ipv4Addr;

    fn di(path: &str) -> DirectoryInfo {
        DirectoryInfo::new(ResourceUrl::parse(&format!("dir:{}", path)).unwrap())
    }

    #[test]
    fn test_create_and_duplicate() {
        let c = DirectoryCache::new();
        assert!(c.create(di("/a/b")));
        assert!(!c.create(di("/a/b")));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_modify_is_atomic_entry_update() {
        let c = DirectoryCache::new();
        c.create(di("/x"));
        let url = ResourceUrl::parse("dir:/x").unwrap();
        let node = NodeId::new(Ipv4Addr::LOCALHOST, 9);
        let joined = c.modify(&url, |d| d.join(node, "m")).flatten();
        assert_eq!(joined, Some("m".to_string()));
        assert_eq!(c.get(&url).unwrap().members.len(), 1);
        assert!(c.modify(&ResourceUrl::parse("dir:/missing").unwrap(), |_| ()).is_none());
    }

    #[test]
    fn test_names_sorted() {
        let c = DirectoryCache::new();
        c.create(di("/b"));
        c.create(di("/a"));
        assert_eq!(c.names(), vec!["/a".to_string(), "/b".to_string()]);
    }
}
