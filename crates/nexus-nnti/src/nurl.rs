//! Transport urls.
//!
//! `sockets://<host>:<port>?<query>` — host and port name the peer's
//! control-plane endpoint, and the query carries fabric-specific rendezvous
//! fields. The 64-bit transport pid is the FNV-1a hash of `host:port`, which
//! keys the connection map.

use std::fmt;
use std::net::Ipv4Addr;

use nexus_common::hash::fnv1a_64;
use nexus_common::nodeid::NodeId;

use crate::error::{NntiError, NntiResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportUrl {
    scheme: String,
    hostname: String,
    port: u16,
    query: Vec<(String, String)>,
}

impl TransportUrl {
    pub fn new(scheme: &str, hostname: &str, port: u16) -> TransportUrl {
        TransportUrl {
            scheme: scheme.to_string(),
            hostname: hostname.to_string(),
            port,
            query: Vec::new(),
        }
    }

    pub fn from_node_id(id: NodeId) -> TransportUrl {
        TransportUrl::new("sockets", &id.ip().to_string(), id.port())
    }

    /// Parse `<scheme>://<host>:<port>[?k=v&k=v]`.
    pub fn parse(s: &str) -> NntiResult<TransportUrl> {
        let (scheme, rest) = s.split_once("://").ok_or(NntiError::Decode)?;
        let (authority, query_str) = match rest.split_once('?') {
            Some((a, q)) => (a, q),
            None => (rest, ""),
        };
        let (host, port_s) = authority.rsplit_once(':').ok_or(NntiError::Decode)?;
        let port: u16 = port_s.parse().map_err(|_| NntiError::Decode)?;
        if scheme.is_empty() || host.is_empty() {
            return Err(NntiError::Decode);
        }

        let mut url = TransportUrl::new(scheme, host, port);
        for kv in query_str.split('&') {
            if kv.is_empty() {
                continue;
            }
            let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
            url.query.push((k.to_string(), v.to_string()));
        }
        Ok(url)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip(&self) -> NntiResult<Ipv4Addr> {
        self.hostname.parse().map_err(|_| NntiError::Decode)
    }

    /// Connection-map key: FNV-1a-64 over `host:port`.
    pub fn pid(&self) -> u64 {
        fnv1a_64(format!("{}:{}", self.hostname, self.port).as_bytes())
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn url_string(&self) -> String {
        let mut s = format!("{}://{}:{}", self.scheme, self.hostname, self.port);
        let mut sep = '?';
        for (k, v) in &self.query {
            s.push(sep);
            sep = '&';
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s
    }
}

impl fmt::Display for TransportUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url_string())
    }
}
