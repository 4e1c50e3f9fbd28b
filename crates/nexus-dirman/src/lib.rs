//! # nexus-dirman
//!
//! Centralized directory manager: a rendezvous directory of named
//! resources. One root node holds the authoritative records; everyone else
//! resolves and mutates them through dispatcher ops and caches the answers.

pub mod cache;
pub mod core;
pub mod ops;

pub use crate::core::DirManCore;
pub use cache::DirectoryCache;
pub use ops::{DirCmd, DirReply, DirRequest, OP_DIRMAN_CENTRALIZED};

use std::sync::{Arc, Mutex};

use nexus_common::config::Configuration;
use nexus_common::error::CommonResult;
use nexus_common::nlog_error;

static CORE: Mutex<Option<Arc<DirManCore>>> = Mutex::new(None);

// snapshotted during the init phase; the start closure runs with the
// lifecycle lock held and must not read bootstrap state back out
static INIT_CONFIG: Mutex<Option<Configuration>> = Mutex::new(None);

/// The process-wide directory manager, once bootstrap has started it.
pub fn dirman() -> Option<Arc<DirManCore>> {
    CORE.lock().unwrap().clone()
}

/// Register the directory manager (and its dependencies) with bootstrap.
/// Returns the component name.
pub fn bootstrap() -> String {
    nexus_opbox::bootstrap();
    let _ = nexus_common::bootstrap::register_component(
        "dirman",
        vec!["opbox".to_string()],
        vec![],
        Box::new(|config: &mut Configuration| -> CommonResult<()> {
            *INIT_CONFIG.lock().unwrap() = Some(config.clone());
            Ok(())
        }),
        // needs the running dispatcher, so it comes up in the start phase
        Box::new(|| {
            let dispatcher = match nexus_opbox::dispatcher() {
                Some(d) => d,
                None => {
                    nlog_error!("dirman", "dispatcher is not running");
                    return;
                }
            };
            let config = INIT_CONFIG.lock().unwrap().take().unwrap_or_default();
            match DirManCore::init(dispatcher, &config) {
                Ok(dm) => {
                    *CORE.lock().unwrap() = Some(dm);
                }
                Err(e) => nlog_error!("dirman", "init failed: {}", e),
            }
        }),
        Box::new(|| {
            let dm = CORE.lock().unwrap().take();
            if let Some(dm) = dm {
                dm.shutdown();
            }
        }),
        true,
    );
    "dirman".to_string()
}
