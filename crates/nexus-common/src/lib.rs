//! # nexus-common
//!
//! Core types and services shared by every layer of the nexus stack.
//!
//! ## Modules
//!
//! - `logging` - leveled stderr logging macros, configured from the environment
//! - `error` - error types
//! - `hash` - FNV-1a hashing (node pids, op ids)
//! - `nodeid` - 64-bit node identifier (packed control-plane address)
//! - `url` - structured resource names
//! - `dirinfo` - directory membership records
//! - `config` - flat key/value configuration with role overrides
//! - `bootstrap` - dependency-ordered component lifecycle
//! - `backburner` - tag-serialized worker pool
//! - `reply` - text/html reply rendering for control-plane hooks

pub mod logging;
pub mod error;
pub mod hash;
pub mod nodeid;
pub mod url;
pub mod dirinfo;
pub mod config;
pub mod bootstrap;
pub mod backburner;
pub mod reply;

// Re-exports for convenience
pub use error::{CommonError, CommonResult};
pub use nodeid::NodeId;
pub use url::ResourceUrl;
pub use dirinfo::{DirectoryInfo, NameAndNode};
pub use config::Configuration;
pub use reply::ReplyStream;
