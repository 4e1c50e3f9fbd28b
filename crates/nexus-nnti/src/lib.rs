//! # nexus-nnti
//!
//! The low-level transport: short eager sends, large rendezvous transfers,
//! one-sided put/get, and 64-bit atomics over a small uniform wire surface.
//! The fabric-independent core (mailbox command messages, credit flow
//! control, state-machine ops, op/connection vectors, event queues,
//! freelists) lives at the crate root; the concrete sockets fabric is under
//! [`sockets`].
//!
//! ## Modules
//!
//! - `types` - ids, flags, attributes, the completion event
//! - `error` - transport result codes
//! - `nurl` - transport urls and pids
//! - `peer` / `sockets::conn` - peers and their connections
//! - `wr` / `wid` - work requests and work ids
//! - `buffer` - registered memory
//! - `eq` - event queues
//! - `freelist` / `opvec` - object pools and indexed slot vectors
//! - `packable` - wire forms of buffers and peers
//! - `sockets` - the TCP fabric and its progress thread

pub mod error;
pub mod types;
pub mod nurl;
pub mod peer;
pub mod wr;
pub mod wid;
pub mod buffer;
pub mod eq;
pub mod freelist;
pub mod opvec;
pub mod packable;
pub mod stats;
pub mod sockets;

// Re-exports for convenience
pub use buffer::Buffer;
pub use eq::EventQueue;
pub use error::{EventResult, NntiError, NntiResult};
pub use nurl::TransportUrl;
pub use peer::Peer;
pub use sockets::SocketsTransport;
pub use types::{buffer_flags, eq_flags, event_types, op_flags};
pub use types::{Event, OpKind, TransportAttrs, TransportId};
pub use wid::WorkId;
pub use wr::{EventCallback, WorkRequest};

use std::sync::{Arc, Mutex};

use nexus_common::config::Configuration;
use nexus_common::error::{CommonError, CommonResult};
use nexus_common::nlog_error;

static INSTANCE: Mutex<Option<Arc<SocketsTransport>>> = Mutex::new(None);

/// The process-wide transport instance, once bootstrap has initialized it.
pub fn transport() -> Option<Arc<SocketsTransport>> {
    INSTANCE.lock().unwrap().clone()
}

/// Register the transport (and its control-plane dependency) with
/// bootstrap. Returns the component name.
pub fn bootstrap() -> String {
    nexus_whookie::bootstrap();
    let _ = nexus_common::bootstrap::register_component(
        "nnti",
        vec!["whookie".to_string()],
        vec![],
        Box::new(|config: &mut Configuration| -> CommonResult<()> {
            let t = SocketsTransport::new(nexus_whookie::server(), config).map_err(|e| {
                CommonError::ComponentInit {
                    component: "nnti".to_string(),
                    detail: e.to_string(),
                }
            })?;
            *INSTANCE.lock().unwrap() = Some(t);
            Ok(())
        }),
        Box::new(|| {
            if let Some(t) = transport() {
                if let Err(e) = t.start() {
                    nlog_error!("nnti", "transport start failed: {}", e);
                }
            }
        }),
        Box::new(|| {
            let t = INSTANCE.lock().unwrap().take();
            if let Some(t) = t {
                t.stop();
            }
        }),
        true,
    );
    "nnti".to_string()
}
