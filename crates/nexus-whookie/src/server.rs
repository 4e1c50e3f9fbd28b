//! The embedded control-plane server.
//!
//! One listener thread accepts plain HTTP/1.1 GETs and dispatches them to
//! registered hooks. The server comes up during bootstrap *init*, not start,
//! because the node id is derived from the bound address and everything
//! above (transports, directory services) needs it early.
//!
//! Start/stop are reference counted so independent subsystems can share the
//! instance; only the last stop tears the listener down.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread;

use nexus_common::bootstrap;
use nexus_common::config::{configlog_snapshot, Configuration};
use nexus_common::error::{CommonError, CommonResult};
use nexus_common::nodeid::{NodeId, NODE_UNSPECIFIED};
use nexus_common::reply::ReplyStream;
use nexus_common::{nlog_debug, nlog_info, nlog_warn};

use crate::request::{parse_request_line, ParseOutcome};

/// A hook handler: query options in, reply out.
pub type HookFn = Arc<dyn Fn(&BTreeMap<String, String>, &mut ReplyStream) + Send + Sync>;

struct ServerState {
    configured: bool,
    num_starters: u32,
    address: Ipv4Addr,
    port: u16,
    node_id: NodeId,
    app_name: String,
    config_entries: Vec<(String, String)>,
    listener_thread: Option<thread::JoinHandle<()>>,
}

pub struct Server {
    state: Mutex<ServerState>,
    hooks: RwLock<BTreeMap<String, HookFn>>,
    shutdown: AtomicBool,
}

impl Server {
    pub fn new() -> Arc<Server> {
        Arc::new(Server {
            state: Mutex::new(ServerState {
                configured: false,
                num_starters: 0,
                address: Ipv4Addr::UNSPECIFIED,
                port: 0,
                node_id: NODE_UNSPECIFIED,
                app_name: "Whookie Application".to_string(),
                config_entries: Vec::new(),
                listener_thread: None,
            }),
            hooks: RwLock::new(BTreeMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    // -- hook registry ------------------------------------------------------

    /// Install a hook; refuses to replace an existing one.
    pub fn register_hook(&self, path: &str, f: HookFn) -> CommonResult<()> {
        let mut hooks = self.hooks.write().unwrap();
        if hooks.contains_key(path) {
            return Err(CommonError::DuplicateComponent(path.to_string()));
        }
        hooks.insert(path.to_string(), f);
        Ok(())
    }

    /// Install or replace a hook.
    pub fn update_hook(&self, path: &str, f: HookFn) {
        self.hooks.write().unwrap().insert(path.to_string(), f);
    }

    pub fn deregister_hook(&self, path: &str) {
        self.hooks.write().unwrap().remove(path);
    }

    pub fn hook_paths(&self) -> Vec<String> {
        self.hooks.read().unwrap().keys().cloned().collect()
    }

    // -- accessors ----------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().configured
    }

    pub fn node_id(&self) -> NodeId {
        self.state.lock().unwrap().node_id
    }

    pub fn port(&self) -> u16 {
        self.state.lock().unwrap().port
    }

    pub fn address(&self) -> Ipv4Addr {
        self.state.lock().unwrap().address
    }

    pub fn app_name(&self) -> String {
        self.state.lock().unwrap().app_name.clone()
    }

    pub fn set_app_name(&self, name: &str) {
        self.state.lock().unwrap().app_name = name.to_string();
    }

    // -- lifecycle ----------------------------------------------------------

    /// Bootstrap-init entry: resolve the bind address, install the built-in
    /// hooks and bring the listener up.
    pub fn init(self: &Arc<Server>, config: &Configuration) -> CommonResult<()> {
        let app_name = config.get_string("whookie.app_name", "Whookie Application");
        let port = config.get_uint("whookie.port", "1990")? as u16;
        let address_s = config.get_lowercase_string("whookie.address", "0.0.0.0");
        let interfaces = config.get_lowercase_string("whookie.interfaces", "eth,lo");

        // Address selection: an explicit whookie.address wins; a wildcard
        // triggers an interface scan over the ordered prefix list.
        let mut address: Ipv4Addr = address_s.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
        if address == Ipv4Addr::UNSPECIFIED {
            if let Some(found) = search_interfaces(&interfaces) {
                address = found;
            }
        }

        {
            let mut st = self.state.lock().unwrap();
            st.app_name = app_name;
            st.config_entries = config.get_all_settings();
        }

        self.install_builtin_hooks();

        nlog_debug!("whookie", "requesting {}:{}", address, port);
        self.start(address, port)?;
        nlog_info!("whookie", "running at {}", self.node_id().http_link());

        bootstrap::set_node_id(self.node_id());
        Ok(())
    }

    /// Bind (probing upward from `requested_port`) and launch the listener
    /// thread. Returns the bound port. Extra starts just bump a refcount.
    pub fn start(self: &Arc<Server>, address: Ipv4Addr, requested_port: u16) -> CommonResult<u16> {
        let mut st = self.state.lock().unwrap();
        st.num_starters += 1;

        if st.configured {
            return Ok(st.port);
        }

        let mut port = requested_port;
        let listener = loop {
            match TcpListener::bind(SocketAddrV4::new(address, port)) {
                Ok(l) => break l,
                Err(e) => {
                    nlog_debug!("whookie", "port {} unavailable ({}), trying next", port, e);
                    if port == u16::MAX {
                        return Err(CommonError::Os(libc::EADDRINUSE));
                    }
                    port += 1;
                }
            }
        };

        self.shutdown.store(false, Ordering::SeqCst);
        let srv = self.clone();
        let l2 = listener.try_clone().map_err(|_| CommonError::Os(libc::EIO))?;
        let handle = thread::Builder::new()
            .name("whookie-server".to_string())
            .spawn(move || srv.accept_loop(l2))
            .expect("failed to spawn whookie server thread");

        st.configured = true;
        st.address = address;
        st.port = port;
        st.node_id = NodeId::new(address, port);
        st.listener_thread = Some(handle);

        Ok(port)
    }

    /// Drop one starter; the last one shuts the listener down.
    pub fn stop(&self) -> u32 {
        // join outside the state lock: in-flight handlers may be reading
        // server state and must be able to finish
        let (handle, target, port) = {
            let mut st = self.state.lock().unwrap();
            if st.num_starters == 0 {
                return 0;
            }
            st.num_starters -= 1;
            if st.num_starters > 0 {
                return st.num_starters;
            }

            self.shutdown.store(true, Ordering::SeqCst);
            let target = if st.address == Ipv4Addr::UNSPECIFIED {
                Ipv4Addr::LOCALHOST
            } else {
                st.address
            };
            st.configured = false;
            (st.listener_thread.take(), target, st.port)
        };

        // poke the acceptor loose
        let _ = TcpStream::connect_timeout(
            &SocketAddr::from(SocketAddrV4::new(target, port)),
            std::time::Duration::from_millis(250),
        );
        if let Some(h) = handle {
            let _ = h.join();
        }
        0
    }

    // -- request handling ---------------------------------------------------

    fn accept_loop(self: Arc<Server>, listener: TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    self.handle_connection(stream);
                }
                Err(_) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }
    }

    fn handle_connection(&self, mut stream: TcpStream) {
        let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(5)));

        // read until end of headers (or a sane cap)
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 8192 {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let first_line = text.lines().next().unwrap_or("");

        let (status, content_type, body) = match parse_request_line(first_line) {
            ParseOutcome::Bad(reason) => (
                400,
                "text/plain",
                format!("400 Bad Request: {}\n", reason),
            ),
            ParseOutcome::Ok(tag, args) => {
                let hook = self.hooks.read().unwrap().get(&tag).cloned();
                match hook {
                    None => (404, "text/plain", format!("404 Not Found: {}\n", tag)),
                    Some(h) => {
                        let mut rs = ReplyStream::new(&args, &tag);
                        h(&args, &mut rs);
                        let ct = rs.content_type();
                        (200, ct, rs.into_body())
                    }
                }
            }
        };

        let status_text = match status {
            200 => "OK",
            400 => "Bad Request",
            _ => "Not Found",
        };
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status, status_text, content_type, body.len(), body
        );
        let _ = stream.write_all(response.as_bytes());
    }

    // -- built-in hooks -----------------------------------------------------

    fn install_builtin_hooks(self: &Arc<Server>) {
        let srv = self.clone();
        self.update_hook("/", Arc::new(move |_args, rs| {
            rs.mk_section(&srv.app_name());
            let links: Vec<String> = srv
                .hook_paths()
                .iter()
                .map(|p| rs.create_link(p, p))
                .collect();
            rs.mk_list(&links, "Registered hooks");
            rs.finish();
        }));

        let srv = self.clone();
        self.update_hook("/about", Arc::new(move |_args, rs| {
            rs.table_begin("Server");
            rs.table_top(&["Parameter", "Value"]);
            rs.table_row(&["App Name".to_string(), srv.app_name()]);
            rs.table_row(&["Address".to_string(), srv.address().to_string()]);
            rs.table_row(&["Port".to_string(), srv.port().to_string()]);
            rs.table_row(&["NodeID".to_string(), srv.node_id().to_hex()]);
            rs.table_end();
            rs.finish();
        }));

        let srv = self.clone();
        self.update_hook("/config", Arc::new(move |_args, rs| {
            let entries = { srv.state.lock().unwrap().config_entries.clone() };
            rs.table_begin("User-Supplied Configuration");
            rs.table_top(&["Parameter", "Value"]);
            for (k, v) in &entries {
                rs.table_row(&[k.clone(), v.clone()]);
            }
            rs.table_end();

            rs.mk_section("All Requested Options");
            rs.table_begin("");
            rs.table_top(&["Parameter", "Field Type", "Default Value"]);
            for (k, t, d) in configlog_snapshot() {
                rs.table_row(&[k, t, d]);
            }
            rs.table_end();
            rs.finish();
        }));

        self.update_hook("/bootstraps", Arc::new(move |_args, rs| {
            let (state, order) = bootstrap::status_summary();
            rs.table_begin("Bootstrap");
            rs.table_top(&["Parameter", "Value"]);
            rs.table_row(&["Current State".to_string(), state]);
            rs.table_end();
            rs.mk_list(&order, "Startup order");
            rs.finish();
        }));
    }
}

/// Scan interfaces for the first up IPv4 address whose interface name starts
/// with one of the comma-separated prefixes, in preference order.
pub fn search_interfaces(prefixes: &str) -> Option<Ipv4Addr> {
    let mut found: Vec<(String, Ipv4Addr)> = Vec::new();

    unsafe {
        let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifap) != 0 {
            return None;
        }
        let mut ifa = ifap;
        while !ifa.is_null() {
            let addr = (*ifa).ifa_addr;
            if !addr.is_null() && (*addr).sa_family == libc::AF_INET as libc::sa_family_t {
                let sin = addr as *const libc::sockaddr_in;
                let ip = Ipv4Addr::from(u32::from_be((*sin).sin_addr.s_addr));
                let name = std::ffi::CStr::from_ptr((*ifa).ifa_name)
                    .to_string_lossy()
                    .into_owned();
                found.push((name, ip));
            }
            ifa = (*ifa).ifa_next;
        }
        libc::freeifaddrs(ifap);
    }

    for prefix in prefixes.split(',') {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            continue;
        }
        for (name, ip) in &found {
            if name.starts_with(prefix) {
                return Some(*ip);
            }
        }
    }
    if !found.is_empty() {
        nlog_warn!("whookie", "no interface matched '{}'; falling back to wildcard", prefixes);
    }
    None
}

// -- process-wide default instance ------------------------------------------

/// The process-wide server every bootstrap-driven component shares.
pub fn server() -> Arc<Server> {
    static G: OnceLock<Arc<Server>> = OnceLock::new();
    G.get_or_init(Server::new).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::http_get;
    use std::time::Duration;

    const BASE_PORT: u16 = 28100;

    #[test]
    fn test_start_probe_and_stop() {
        let a = Server::new();
        let p1 = a.start(Ipv4Addr::LOCALHOST, BASE_PORT).unwrap();
        assert_eq!(p1, BASE_PORT);

        // second server probes upward past the occupied port
        let b = Server::new();
        let p2 = b.start(Ipv4Addr::LOCALHOST, BASE_PORT).unwrap();
        assert_eq!(p2, BASE_PORT + 1);

        assert!(a.is_running());
        assert!(b.is_running());
        a.stop();
        b.stop();
        assert!(!a.is_running());
    }

    #[test]
    fn test_refcounted_stop() {
        let s = Server::new();
        s.start(Ipv4Addr::LOCALHOST, BASE_PORT + 10).unwrap();
        s.start(Ipv4Addr::LOCALHOST, BASE_PORT + 10).unwrap();
        assert_eq!(s.stop(), 1);
        assert!(s.is_running());
        assert_eq!(s.stop(), 0);
        assert!(!s.is_running());
    }

    #[test]
    fn test_hook_round_trip() {
        let s = Server::new();
        let port = s.start(Ipv4Addr::LOCALHOST, BASE_PORT + 20).unwrap();

        s.update_hook("/hello", Arc::new(|args, rs| {
            let v = args.get("newval").cloned().unwrap_or_default();
            rs.raw(&format!("value={}", v));
        }));

        let (status, body) = http_get(
            Ipv4Addr::LOCALHOST,
            port,
            "/hello&newval=42&format=text",
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, "value=42\n");

        s.deregister_hook("/hello");
        let (status, _) = http_get(
            Ipv4Addr::LOCALHOST,
            port,
            "/hello&newval=42&format=text",
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(status, 404);

        s.stop();
    }

    #[test]
    fn test_bad_request() {
        let s = Server::new();
        let port = s.start(Ipv4Addr::LOCALHOST, BASE_PORT + 30).unwrap();
        let (status, _) = http_get(
            Ipv4Addr::LOCALHOST,
            port,
            "/a/../b&format=text",
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(status, 400);
        s.stop();
    }

    #[test]
    fn test_node_id_matches_bind() {
        let s = Server::new();
        let port = s.start(Ipv4Addr::LOCALHOST, BASE_PORT + 40).unwrap();
        let id = s.node_id();
        assert_eq!(id.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(id.port(), port);
        s.stop();
    }

    #[test]
    fn test_interface_scan_finds_loopback() {
        // every test box has some lo* interface
        let found = search_interfaces("lo");
        assert_eq!(found, Some(Ipv4Addr::LOCALHOST));
    }
}
