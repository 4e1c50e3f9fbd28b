//! # nexus-opbox
//!
//! The op dispatcher: user-defined state machines multiplexed onto the
//! transport. Each live op gets a 32-bit mailbox; all of its updates —
//! start, arriving messages, user triggers — execute serially in arrival
//! order on the backburner worker that owns the mailbox.

pub mod message;
pub mod op;
pub mod registry;
pub mod core;

pub use crate::core::OpBoxCore;
pub use message::{Message, MAILBOX_UNSPECIFIED, MSG_HEADER_LEN};
pub use op::{IncomingMessage, Op, OpArgs, UpdateType, WaitingType};
pub use registry::{OpFactory, OpRegistry};

use std::sync::{Arc, Mutex};

use nexus_common::config::Configuration;
use nexus_common::error::CommonResult;
use nexus_common::nlog_error;

static CORE: Mutex<Option<Arc<OpBoxCore>>> = Mutex::new(None);

/// The process-wide dispatcher, once bootstrap has started it.
pub fn dispatcher() -> Option<Arc<OpBoxCore>> {
    CORE.lock().unwrap().clone()
}

/// Register the dispatcher (and its dependencies) with bootstrap. Returns
/// the component name.
pub fn bootstrap() -> String {
    nexus_nnti::bootstrap();
    nexus_common::backburner::bootstrap();
    let _ = nexus_common::bootstrap::register_component(
        "opbox",
        vec!["whookie".to_string(), "nnti".to_string(), "backburner".to_string()],
        vec![],
        Box::new(|_config: &mut Configuration| -> CommonResult<()> { Ok(()) }),
        // the dispatcher needs the started transport, so it comes up in the
        // start phase
        Box::new(|| {
            let transport = match nexus_nnti::transport() {
                Some(t) => t,
                None => {
                    nlog_error!("opbox", "transport is not initialized");
                    return;
                }
            };
            match OpBoxCore::init(transport, nexus_whookie::server()) {
                Ok(core) => {
                    *CORE.lock().unwrap() = Some(core);
                }
                Err(e) => nlog_error!("opbox", "dispatcher init failed: {}", e),
            }
        }),
        Box::new(|| {
            let core = CORE.lock().unwrap().take();
            if let Some(c) = core {
                c.shutdown();
            }
        }),
        true,
    );
    "opbox".to_string()
}

/// Convenience wrappers over the process-wide dispatcher.
pub fn launch_op(op: Box<dyn Op>) -> Option<u32> {
    dispatcher().map(|c| c.launch_op(op))
}

pub fn register_op(op_id: u32, op_name: &str, factory: OpFactory) -> CommonResult<()> {
    match dispatcher() {
        Some(c) => c.register_op(op_id, op_name, factory),
        None => Err(nexus_common::error::CommonError::WrongState {
            wanted: "started",
            current: "unconfigured",
        }),
    }
}
