//! The centralized directory manager.
//!
//! One root node (named by `dirman.root_node`) holds the authoritative
//! cache. Every other node keeps two caches — resources it hosts and
//! foreign resources it has looked up — plus an owner map from resource
//! path to owning node. Misses go to the root over a dispatcher op and
//! populate the local caches on the way back.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use nexus_common::config::Configuration;
use nexus_common::dirinfo::DirectoryInfo;
use nexus_common::error::{CommonError, CommonResult};
use nexus_common::nodeid::NodeId;
use nexus_common::url::ResourceUrl;
use nexus_common::{nlog_debug, nlog_info};

use nexus_opbox::OpBoxCore;

use crate::cache::DirectoryCache;
use crate::ops::{DirCmd, DirManOrigin, DirManTarget, DirReply, DirRequest, OP_DIRMAN_CENTRALIZED};

const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DirManCore {
    core: Arc<OpBoxCore>,
    my_node: NodeId,
    root: NodeId,
    am_root: bool,
    /// Resources this node hosts (the whole world, on the root).
    owned: DirectoryCache,
    /// Foreign resources this node has resolved.
    foreign: DirectoryCache,
    /// Resource path -> owning node, for parent walks and diagnostics.
    owners: Mutex<HashMap<String, NodeId>>,
}

impl DirManCore {
    /// Stand the directory manager up on a running dispatcher. The root
    /// node comes from `dirman.root_node` (hex NodeId); a node with no root
    /// configured, or whose own id matches it, acts as the root.
    pub fn init(core: Arc<OpBoxCore>, config: &Configuration) -> CommonResult<Arc<DirManCore>> {
        let my_node = core.my_node();
        let configured = config.get_string("dirman.root_node", "");
        let root = if configured.is_empty() {
            my_node
        } else {
            NodeId::from_hex(&configured)
                .ok_or_else(|| CommonError::BadConfigValue {
                    key: "dirman.root_node".to_string(),
                    value: configured.clone(),
                })?
        };
        let am_root = root == my_node;

        let dm = Arc::new(DirManCore {
            core: core.clone(),
            my_node,
            root,
            am_root,
            owned: DirectoryCache::new(),
            foreign: DirectoryCache::new(),
            owners: Mutex::new(HashMap::new()),
        });

        // the target side of the dirman op materializes against this instance
        let dm2 = dm.clone();
        core.register_op(
            OP_DIRMAN_CENTRALIZED,
            "OpDirManCentralized",
            Box::new(move || {
                let op: Box<dyn nexus_opbox::Op> = Box::new(DirManTarget::new(dm2.clone()));
                op
            }),
        )?;

        dm.install_hook();
        nlog_info!(
            "dirman",
            "centralized dirman up (root {}, {})",
            dm.root,
            if am_root { "acting as root" } else { "client" }
        );
        Ok(dm)
    }

    pub fn shutdown(&self) {
        self.core.deregister_op(OP_DIRMAN_CENTRALIZED);
        self.core.whookie().deregister_hook("/dirman");
    }

    pub fn my_node(&self) -> NodeId {
        self.my_node
    }

    pub fn root_node(&self) -> NodeId {
        self.root
    }

    pub fn am_root(&self) -> bool {
        self.am_root
    }

    // -- public surface ------------------------------------------------------

    /// Host a new directory. The record lands in the authoritative cache on
    /// the root and in this node's owned cache.
    pub fn host_new_dir(self: &Arc<Self>, mut di: DirectoryInfo) -> CommonResult<DirectoryInfo> {
        if !di.url.reference_node.valid() {
            di.url.reference_node = self.my_node;
        }
        if self.am_root {
            self.owned.upsert(di.clone());
            self.owners
                .lock()
                .unwrap()
                .insert(di.url.path_name(), di.url.reference_node);
            return Ok(di);
        }

        self.owned.upsert(di.clone());
        let req = DirRequest {
            cmd: DirCmd::Host,
            url: di.to_url().full_url(),
            name: String::new(),
            node: self.my_node,
        };
        let reply = self.remote_request(req)?;
        reply
            .info
            .ok_or_else(|| CommonError::ComponentInit {
                component: "dirman".to_string(),
                detail: "root refused to host directory".to_string(),
            })
    }

    /// Look a resource up: local caches first, then the root.
    pub fn get_directory_info(self: &Arc<Self>, url: &ResourceUrl) -> CommonResult<Option<DirectoryInfo>> {
        if let Some(di) = self.get_local_directory_info(url) {
            return Ok(Some(di));
        }
        if self.am_root {
            return Ok(None);
        }

        let req = DirRequest {
            cmd: DirCmd::Get,
            url: url.full_url(),
            name: String::new(),
            node: self.my_node,
        };
        let reply = self.remote_request(req)?;
        if let Some(di) = &reply.info {
            self.remember_foreign(di);
        }
        Ok(reply.info)
    }

    /// Caches only; never talks to the root.
    pub fn get_local_directory_info(&self, url: &ResourceUrl) -> Option<DirectoryInfo> {
        self.owned.get(url).or_else(|| self.foreign.get(url))
    }

    /// Join this node (or a named child) to a directory; the updated record
    /// comes back. None when the directory does not exist.
    pub fn join_dir(self: &Arc<Self>, url: &ResourceUrl, name: &str) -> CommonResult<Option<DirectoryInfo>> {
        let req = DirRequest {
            cmd: DirCmd::Join,
            url: url.full_url(),
            name: name.to_string(),
            node: self.my_node,
        };
        if self.am_root {
            return Ok(self.apply_local(&req).info);
        }
        let reply = self.remote_request(req)?;
        if let Some(di) = &reply.info {
            self.remember_foreign(di);
        }
        Ok(reply.info)
    }

    /// Leave a directory, by the url's leaf name when it matches a member,
    /// otherwise by this node's id.
    pub fn leave_dir(self: &Arc<Self>, url: &ResourceUrl) -> CommonResult<Option<DirectoryInfo>> {
        let req = DirRequest {
            cmd: DirCmd::Leave,
            url: url.full_url(),
            name: String::new(),
            node: self.my_node,
        };
        if self.am_root {
            return Ok(self.apply_local(&req).info);
        }
        let reply = self.remote_request(req)?;
        if let Some(di) = &reply.info {
            self.remember_foreign(di);
        }
        Ok(reply.info)
    }

    /// Walk the url's lineage upward until a known directory is found.
    pub fn get_parent_info(
        self: &Arc<Self>,
        url: &ResourceUrl,
    ) -> CommonResult<Option<DirectoryInfo>> {
        let mut cursor = url.parent();
        while let Some(candidate) = cursor {
            if let Some(di) = self.get_directory_info(&candidate)? {
                return Ok(Some(di));
            }
            cursor = candidate.parent();
        }
        Ok(None)
    }

    // -- root-side application ----------------------------------------------

    /// Apply a request against the authoritative cache. Called on the root,
    /// either directly or from the target op.
    pub(crate) fn apply_local(&self, req: &DirRequest) -> DirReply {
        match req.cmd {
            DirCmd::Host => match ResourceUrl::parse(&req.url) {
                Ok(u) => {
                    let di = DirectoryInfo::from_url(u);
                    self.owners
                        .lock()
                        .unwrap()
                        .insert(di.url.path_name(), req.node);
                    self.owned.upsert(di.clone());
                    nlog_debug!("dirman", "hosting {} for {}", di.url.path_name(), req.node);
                    DirReply::found(di)
                }
                Err(_) => DirReply::missing(),
            },
            DirCmd::Get => match ResourceUrl::parse(&req.url) {
                Ok(u) => match self.owned.get(&u) {
                    Some(di) => DirReply::found(di),
                    None => DirReply::missing(),
                },
                Err(_) => DirReply::missing(),
            },
            DirCmd::Join => match ResourceUrl::parse(&req.url) {
                Ok(u) => {
                    let joined = self.owned.modify(&u, |di| {
                        di.join(req.node, &req.name);
                        di.clone()
                    });
                    match joined {
                        Some(di) => DirReply::found(di),
                        None => DirReply::missing(),
                    }
                }
                Err(_) => DirReply::missing(),
            },
            DirCmd::Leave => match ResourceUrl::parse(&req.url) {
                Ok(u) => {
                    let left = self.owned.modify(&u, |di| {
                        if !di.leave_by_name(&u.name) {
                            di.leave_by_node(req.node);
                        }
                        di.clone()
                    });
                    match left {
                        Some(di) => DirReply::found(di),
                        None => DirReply::missing(),
                    }
                }
                Err(_) => DirReply::missing(),
            },
        }
    }

    fn remember_foreign(&self, di: &DirectoryInfo) {
        self.foreign.upsert(di.clone());
        if di.url.reference_node.valid() {
            self.owners
                .lock()
                .unwrap()
                .insert(di.url.path_name(), di.url.reference_node);
        }
    }

    fn remote_request(self: &Arc<Self>, req: DirRequest) -> CommonResult<DirReply> {
        let (tx, rx) = mpsc::sync_channel(1);
        let op = DirManOrigin::new(self.root, req, tx);
        self.core.launch_op(Box::new(op));
        rx.recv_timeout(REMOTE_TIMEOUT)
            .map_err(|_| CommonError::ComponentInit {
                component: "dirman".to_string(),
                detail: "root did not answer".to_string(),
            })
    }

    // -- introspection -------------------------------------------------------

    fn install_hook(self: &Arc<Self>) {
        let dm = self.clone();
        self.core.whookie().update_hook("/dirman", Arc::new(move |_args, rs| {
            rs.table_begin("DirMan");
            rs.table_top(&["Parameter", "Value"]);
            rs.table_row(&["Root".to_string(), dm.root.to_hex()]);
            rs.table_row(&["Acting as root".to_string(), dm.am_root.to_string()]);
            rs.table_row(&["Owned entries".to_string(), dm.owned.len().to_string()]);
            rs.table_row(&["Foreign entries".to_string(), dm.foreign.len().to_string()]);
            rs.table_end();
            rs.mk_list(&dm.owned.names(), "Owned");
            rs.mk_list(&dm.foreign.names(), "Foreign");
            rs.finish();
        }));
    }
}
