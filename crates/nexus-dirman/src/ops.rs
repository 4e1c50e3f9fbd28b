//! The dispatcher ops that carry directory requests to the root node.
//!
//! Request and reply bodies are line-oriented: urls may contain `&`, so the
//! fields travel one per line instead of as a query string.

use std::sync::{mpsc, Arc};

use nexus_common::dirinfo::DirectoryInfo;
use nexus_common::hash::fnv1a_32;
use nexus_common::nodeid::{NodeId, NODE_UNSPECIFIED};
use nexus_common::url::ResourceUrl;

use nexus_opbox::{Message, Op, OpArgs, UpdateType, WaitingType};

use crate::core::DirManCore;

pub const OP_DIRMAN_CENTRALIZED: u32 = fnv1a_32(b"OpDirManCentralized");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirCmd {
    Host,
    Get,
    Join,
    Leave,
}

impl DirCmd {
    fn token(&self) -> &'static str {
        match self {
            DirCmd::Host => "host",
            DirCmd::Get => "get",
            DirCmd::Join => "join",
            DirCmd::Leave => "leave",
        }
    }

    fn parse(s: &str) -> Option<DirCmd> {
        match s {
            "host" => Some(DirCmd::Host),
            "get" => Some(DirCmd::Get),
            "join" => Some(DirCmd::Join),
            "leave" => Some(DirCmd::Leave),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirRequest {
    pub cmd: DirCmd,
    /// The resource url; for Host it carries the whole serialized record.
    pub url: String,
    pub name: String,
    pub node: NodeId,
}

impl DirRequest {
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}\n",
            self.cmd.token(),
            self.url,
            self.name,
            self.node.to_hex()
        )
        .into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Option<DirRequest> {
        let text = String::from_utf8_lossy(raw);
        let mut lines = text.lines();
        let cmd = DirCmd::parse(lines.next()?)?;
        let url = lines.next()?.to_string();
        let name = lines.next().unwrap_or("").to_string();
        let node = lines
            .next()
            .and_then(NodeId::from_hex)
            .unwrap_or(NODE_UNSPECIFIED);
        Some(DirRequest { cmd, url, name, node })
    }
}

#[derive(Debug, Clone)]
pub struct DirReply {
    pub found: bool,
    pub info: Option<DirectoryInfo>,
}

impl DirReply {
    pub fn missing() -> DirReply {
        DirReply { found: false, info: None }
    }

    pub fn found(info: DirectoryInfo) -> DirReply {
        DirReply { found: true, info: Some(info) }
    }

    pub fn encode(&self) -> Vec<u8> {
        match &self.info {
            Some(di) => format!("ok\n{}\n", di.to_url().full_url()).into_bytes(),
            None => b"missing\n".to_vec(),
        }
    }

    pub fn decode(raw: &[u8]) -> Option<DirReply> {
        let text = String::from_utf8_lossy(raw);
        let mut lines = text.lines();
        match lines.next()? {
            "ok" => {
                let url = ResourceUrl::parse(lines.next()?).ok()?;
                Some(DirReply::found(DirectoryInfo::from_url(url)))
            }
            "missing" => Some(DirReply::missing()),
            _ => None,
        }
    }
}

/// Root side: apply the request against the authoritative cache and answer.
pub struct DirManTarget {
    dm: Arc<DirManCore>,
}

impl DirManTarget {
    pub fn new(dm: Arc<DirManCore>) -> DirManTarget {
        DirManTarget { dm }
    }
}

impl Op for DirManTarget {
    fn op_id(&self) -> u32 {
        OP_DIRMAN_CENTRALIZED
    }
    fn op_name(&self) -> &'static str {
        "OpDirManCentralized"
    }
    fn update(&mut self, args: &mut OpArgs) -> WaitingType {
        if let Some(inc) = &args.incoming {
            let reply = match DirRequest::decode(&inc.msg.body) {
                Some(req) => self.dm.apply_local(&req),
                None => DirReply::missing(),
            };
            let out = Message::new(
                OP_DIRMAN_CENTRALIZED,
                inc.msg.src_mailbox,
                args.mailbox,
                args.core.my_node(),
            )
            .with_body(reply.encode());
            let _ = args.core.send_message(inc.msg.src_node, &out);
        }
        WaitingType::DoneAndDestroy
    }
    fn state_name(&self) -> String {
        "answering".to_string()
    }
}

/// Non-root side: carry one request to the root, hand the reply back
/// through a channel.
pub struct DirManOrigin {
    root: NodeId,
    request: DirRequest,
    reply_tx: mpsc::SyncSender<DirReply>,
}

impl DirManOrigin {
    pub fn new(root: NodeId, request: DirRequest, reply_tx: mpsc::SyncSender<DirReply>) -> Self {
        DirManOrigin { root, request, reply_tx }
    }
}

impl Op for DirManOrigin {
    fn op_id(&self) -> u32 {
        OP_DIRMAN_CENTRALIZED
    }
    fn op_name(&self) -> &'static str {
        "OpDirManCentralized"
    }
    fn update(&mut self, args: &mut OpArgs) -> WaitingType {
        match args.update_type {
            UpdateType::Start => {
                let msg = Message::new(
                    OP_DIRMAN_CENTRALIZED,
                    0,
                    args.mailbox,
                    args.core.my_node(),
                )
                .with_body(self.request.encode());
                match args.core.send_message(self.root, &msg) {
                    Ok(_) => WaitingType::WaitingOnMessage,
                    Err(_) => {
                        let _ = self.reply_tx.send(DirReply::missing());
                        WaitingType::DoneAndDestroy
                    }
                }
            }
            UpdateType::Incoming => {
                let reply = args
                    .incoming
                    .as_ref()
                    .and_then(|i| DirReply::decode(&i.msg.body))
                    .unwrap_or_else(DirReply::missing);
                let _ = self.reply_tx.send(reply);
                WaitingType::DoneAndDestroy
            }
            UpdateType::UserTrigger => WaitingType::WaitingOnMessage,
        }
    }
    fn state_name(&self) -> String {
        "asking root".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_request_round_trip() {
        let req = DirRequest {
            cmd: DirCmd::Join,
            url: "dht:/a/b?min_members=2".to_string(),
            name: "worker".to_string(),
            node: NodeId::new(Ipv4Addr::LOCALHOST, 1990),
        };
        let again = DirRequest::decode(&req.encode()).unwrap();
        assert_eq!(again.cmd, DirCmd::Join);
        assert_eq!(again.url, req.url);
        assert_eq!(again.name, "worker");
        assert_eq!(again.node, req.node);
    }

    #[test]
    fn test_reply_round_trip() {
        let mut di = DirectoryInfo::new(ResourceUrl::parse("dht:/a/b").unwrap());
        di.min_members = 2;
        di.join(NodeId::new(Ipv4Addr::LOCALHOST, 7), "x");

        let again = DirReply::decode(&DirReply::found(di.clone()).encode()).unwrap();
        assert!(again.found);
        assert_eq!(again.info.unwrap(), di);

        let missing = DirReply::decode(&DirReply::missing().encode()).unwrap();
        assert!(!missing.found);
        assert!(missing.info.is_none());
    }

    #[test]
    fn test_op_id_is_stable() {
        assert_eq!(OP_DIRMAN_CENTRALIZED, fnv1a_32(b"OpDirManCentralized"));
    }
}
