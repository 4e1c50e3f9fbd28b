//! Structured resource names.
//!
//! A resource url has the shape `<kind>:/<path>/<leaf>?<k>=<v>&<k>=<v>`.
//! The kind tags the resource type (`ref`, `dir`, `dht`, `local`, ...), the
//! path is hierarchical, and the options are free-form key/value pairs. A
//! `node` option carries the reference node in hex and is surfaced as a
//! typed field.

use std::fmt;

use crate::error::{CommonError, CommonResult};
use crate::nodeid::{NodeId, NODE_UNSPECIFIED};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUrl {
    pub kind: String,
    /// Directory portion, always beginning with `/` (just `/` at the root).
    pub path: String,
    /// Leaf name; empty for the root itself.
    pub name: String,
    /// Node that hosts or anchors the resource.
    pub reference_node: NodeId,
    options: Vec<(String, String)>,
}

impl ResourceUrl {
    pub fn new(kind: &str, path: &str, name: &str) -> Self {
        ResourceUrl {
            kind: kind.to_string(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            name: name.to_string(),
            reference_node: NODE_UNSPECIFIED,
            options: Vec::new(),
        }
    }

    /// Parse `<kind>:/<path>/<leaf>?<options>`.
    pub fn parse(s: &str) -> CommonResult<ResourceUrl> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| CommonError::BadUrl(s.to_string()))?;
        if kind.is_empty() || !rest.starts_with('/') {
            return Err(CommonError::BadUrl(s.to_string()));
        }

        let (full_path, opt_str) = match rest.split_once('?') {
            Some((p, o)) => (p, o),
            None => (rest, ""),
        };

        let trimmed = full_path.trim_end_matches('/');
        let (path, name) = match trimmed.rfind('/') {
            Some(0) => ("/".to_string(), trimmed[1..].to_string()),
            Some(i) => (trimmed[..i].to_string(), trimmed[i + 1..].to_string()),
            None => ("/".to_string(), String::new()),
        };

        let mut url = ResourceUrl {
            kind: kind.to_string(),
            path,
            name,
            reference_node: NODE_UNSPECIFIED,
            options: Vec::new(),
        };

        for kv in opt_str.split('&') {
            if kv.is_empty() {
                continue;
            }
            let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
            url.set_option(k, v);
        }

        Ok(url)
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_empty() && self.name.is_empty() && self.options.is_empty()
    }

    /// `/<path>/<leaf>` without kind or options.
    pub fn path_name(&self) -> String {
        if self.name.is_empty() {
            self.path.clone()
        } else if self.path == "/" {
            format!("/{}", self.name)
        } else {
            format!("{}/{}", self.path, self.name)
        }
    }

    /// Url of this resource's parent, or None at the root.
    pub fn parent(&self) -> Option<ResourceUrl> {
        if self.name.is_empty() {
            return None;
        }
        let mut p = self.clone();
        p.options.clear();
        p.reference_node = NODE_UNSPECIFIED;
        match self.path.rfind('/') {
            // already a top-level name, no parent resource above it
            Some(0) if self.path == "/" => return None,
            Some(0) => {
                p.name = self.path[1..].to_string();
                p.path = "/".to_string();
            }
            Some(i) => {
                p.name = self.path[i + 1..].to_string();
                p.path = self.path[..i].to_string();
            }
            None => return None,
        }
        Some(p)
    }

    pub fn get_option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set or replace an option. The `node` key updates the reference node.
    pub fn set_option(&mut self, key: &str, value: &str) {
        if key == "node" {
            if let Some(id) = NodeId::from_hex(value) {
                self.reference_node = id;
            }
            return;
        }
        if let Some(slot) = self.options.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.to_string();
        } else {
            self.options.push((key.to_string(), value.to_string()));
        }
    }

    pub fn remove_option(&mut self, key: &str) -> Option<String> {
        if let Some(pos) = self.options.iter().position(|(k, _)| k == key) {
            Some(self.options.remove(pos).1)
        } else {
            None
        }
    }

    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// Full string form that [`parse`](Self::parse) round-trips.
    pub fn full_url(&self) -> String {
        let mut s = format!("{}:{}", self.kind, self.path_name());
        let mut sep = '?';
        if self.reference_node.valid() {
            s.push(sep);
            s.push_str(&format!("node={}", self.reference_node.to_hex()));
            sep = '&';
        }
        for (k, v) in &self.options {
            s.push(sep);
            sep = '&';
            s.push_str(k);
            if !v.is_empty() {
                s.push('=');
                s.push_str(v);
            }
        }
        s
    }
}

impl Default for ResourceUrl {
    fn default() -> Self {
        ResourceUrl::new("", "/", "")
    }
}

impl fmt::Display for ResourceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_url())
    }
}

/// Percent-encode the characters that would break option parsing
/// (`&`, `=`, `?`, `%`, and whitespace).
pub fn percent_encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'&' | b'=' | b'?' | b'%' | b' ' | b'\t' | b'\n' | b'\r' => {
                out.push('%');
                out.push_str(&format!("{:02X}", b));
            }
            _ => out.push(b as char),
        }
    }
    out
}

/// Decode `%XX` escapes (and `+` as space). Malformed escapes pass through.
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(v) => {
                        out.push(v);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_basic() {
        let u = ResourceUrl::parse("dht:/radix/leaf?min_members=2").unwrap();
        assert_eq!(u.kind, "dht");
        assert_eq!(u.path, "/radix");
        assert_eq!(u.name, "leaf");
        assert_eq!(u.get_option("min_members"), Some("2"));
    }

    #[test]
    fn test_round_trip() {
        let mut u = ResourceUrl::new("dir", "/a/b", "c");
        u.set_option("info", "hello");
        u.reference_node = NodeId::new(Ipv4Addr::new(127, 0, 0, 1), 1990);
        let s = u.full_url();
        let parsed = ResourceUrl::parse(&s).unwrap();
        assert_eq!(u, parsed);
        assert_eq!(parsed.reference_node.port(), 1990);
    }

    #[test]
    fn test_parent_lineage() {
        let u = ResourceUrl::parse("dir:/a/b/c").unwrap();
        let p1 = u.parent().unwrap();
        assert_eq!(p1.path_name(), "/a/b");
        let p2 = p1.parent().unwrap();
        assert_eq!(p2.path_name(), "/a");
        assert!(p2.parent().is_none());
    }

    #[test]
    fn test_option_add_remove() {
        let mut u = ResourceUrl::parse("ref:/x/y").unwrap();
        assert_eq!(u.get_option("num"), None);
        u.set_option("num", "3");
        assert_eq!(u.get_option("num"), Some("3"));
        u.set_option("num", "4");
        assert_eq!(u.get_option("num"), Some("4"));
        assert_eq!(u.remove_option("num"), Some("4".to_string()));
        assert_eq!(u.get_option("num"), None);
    }

    #[test]
    fn test_percent_round_trip() {
        let s = "a pool & more = 100%";
        let enc = percent_encode_component(s);
        assert!(!enc.contains('&'));
        assert!(!enc.contains('='));
        assert_eq!(percent_decode(&enc), s);
    }

    #[test]
    fn test_percent_decode_plus_and_malformed() {
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn test_bad_urls() {
        assert!(ResourceUrl::parse("no-colon/path").is_err());
        assert!(ResourceUrl::parse(":/missing-kind").is_err());
        assert!(ResourceUrl::parse("dht:relative/path").is_err());
    }
}
