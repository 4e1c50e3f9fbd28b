//! # nexus-whookie
//!
//! The embedded HTTP/1.1 control server. Components hang hooks off it for
//! live introspection, and the transport layer uses it as the out-of-band
//! rendezvous channel for connection setup.
//!
//! Most applications never touch this crate directly beyond calling
//! [`bootstrap`] so the server registers itself with the lifecycle manager.

pub mod client;
pub mod request;
pub mod server;

pub use client::{http_get, parse_kv_body};
pub use server::{search_interfaces, server, HookFn, Server};

use std::sync::Arc;

use nexus_common::config::Configuration;
use nexus_common::error::CommonResult;

/// Register the default server with bootstrap. Returns the component name.
pub fn bootstrap() -> String {
    let _ = nexus_common::bootstrap::register_component(
        "whookie",
        vec![],
        vec![],
        Box::new(|config: &mut Configuration| -> CommonResult<()> {
            server().init(config)
        }),
        // the server is already up: init started it so the node id exists early
        Box::new(|| {}),
        Box::new(|| {
            server().stop();
        }),
        true,
    );
    "whookie".to_string()
}

/// Convenience wrappers over the default server's hook registry.
pub fn register_hook(path: &str, f: HookFn) -> CommonResult<()> {
    server().register_hook(path, f)
}

pub fn update_hook(path: &str, f: HookFn) {
    server().update_hook(path, f)
}

pub fn deregister_hook(path: &str) {
    server().deregister_hook(path)
}

/// Shared handle type for handler closures.
pub fn hook(f: impl Fn(&std::collections::BTreeMap<String, String>, &mut nexus_common::ReplyStream) + Send + Sync + 'static) -> HookFn {
    Arc::new(f)
}
