//! Two-node directory behavior: a root and a client resolving, joining and
//! leaving through it.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use nexus_common::dirinfo::DirectoryInfo;
use nexus_common::url::ResourceUrl;
use nexus_common::Configuration;
use nexus_dirman::DirManCore;
use nexus_nnti::sockets::SocketsTransport;
use nexus_opbox::OpBoxCore;
use nexus_whookie::Server;

struct Node {
    whookie: Arc<Server>,
    transport: Arc<SocketsTransport>,
    core: Arc<OpBoxCore>,
    dirman: Arc<DirManCore>,
}

impl Node {
    fn up(port: u16, root_hex: Option<String>) -> Node {
        if !nexus_common::backburner::is_configured() {
            nexus_common::backburner::configure(&Configuration::from_str_literal(
                "backburner.threads 2\n",
            ))
            .unwrap();
        }
        let whookie = Server::new();
        whookie.start(Ipv4Addr::LOCALHOST, port).unwrap();
        let transport = SocketsTransport::new(whookie.clone(), &Configuration::new()).unwrap();
        transport.start().unwrap();
        let core = OpBoxCore::init(transport.clone(), whookie.clone()).unwrap();

        let config = match &root_hex {
            Some(hex) => {
                Configuration::from_str_literal(&format!("dirman.root_node {}\n", hex))
            }
            None => Configuration::new(),
        };
        let dirman = DirManCore::init(core.clone(), &config).unwrap();
        Node { whookie, transport, core, dirman }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.dirman.shutdown();
        self.core.shutdown();
        self.transport.stop();
        self.whookie.stop();
    }
}

fn url(s: &str) -> ResourceUrl {
    ResourceUrl::parse(s).unwrap()
}

#[test]
fn client_resolves_joins_and_leaves_through_root() {
    let root = Node::up(28610, None);
    assert!(root.dirman.am_root());

    let client = Node::up(28611, Some(root.dirman.my_node().to_hex()));
    assert!(!client.dirman.am_root());
    assert_eq!(client.dirman.root_node(), root.dirman.my_node());

    // nothing there yet
    assert!(client
        .dirman
        .get_directory_info(&url("dht:/radix/leaf"))
        .unwrap()
        .is_none());

    // root hosts a directory
    let mut di = DirectoryInfo::new(url("dht:/radix/leaf"));
    di.info = "test pool".to_string();
    di.min_members = 2;
    root.dirman.host_new_dir(di).unwrap();

    // client sees it now and caches it
    let seen = client
        .dirman
        .get_directory_info(&url("dht:/radix/leaf"))
        .unwrap()
        .expect("directory must be visible through the root");
    assert_eq!(seen.info, "test pool");
    assert_eq!(seen.min_members, 2);
    assert!(!seen.is_viable());
    assert!(client
        .dirman
        .get_local_directory_info(&url("dht:/radix/leaf"))
        .is_some());

    // join from both sides; auto-generated names are unique
    let after_client = client
        .dirman
        .join_dir(&url("dht:/radix/leaf"), "")
        .unwrap()
        .unwrap();
    assert_eq!(after_client.members.len(), 1);
    assert!(after_client.members[0].name.starts_with("ag"));
    assert!(after_client.contains_node(client.dirman.my_node()));

    let after_root = root
        .dirman
        .join_dir(&url("dht:/radix/leaf"), "")
        .unwrap()
        .unwrap();
    assert_eq!(after_root.members.len(), 2);
    assert_ne!(after_root.members[0].name, after_root.members[1].name);
    assert!(after_root.is_viable(), "two members satisfy min_members=2");

    // named join collides and is refused (membership unchanged)
    let existing = after_root.members[0].name.clone();
    let after_dup = client
        .dirman
        .join_dir(&url("dht:/radix/leaf"), &existing)
        .unwrap()
        .unwrap();
    assert_eq!(after_dup.members.len(), 2);

    // leave by node
    let after_leave = client
        .dirman
        .leave_dir(&url("dht:/radix/leaf"))
        .unwrap()
        .unwrap();
    assert_eq!(after_leave.members.len(), 1);
    assert!(!after_leave.contains_node(client.dirman.my_node()));
}

#[test]
fn parent_lineage_walks_to_nearest_known_directory() {
    let root = Node::up(28620, None);
    let client = Node::up(28621, Some(root.dirman.my_node().to_hex()));

    root.dirman
        .host_new_dir(DirectoryInfo::new(url("dir:/a")))
        .unwrap();
    root.dirman
        .host_new_dir(DirectoryInfo::new(url("dir:/a/b")))
        .unwrap();

    let found = client
        .dirman
        .get_parent_info(&url("dir:/a/b/c/d"))
        .unwrap()
        .expect("lineage walk must land on /a/b");
    assert_eq!(found.url.path_name(), "/a/b");

    let found = client
        .dirman
        .get_parent_info(&url("dir:/a/x"))
        .unwrap()
        .expect("lineage walk must land on /a");
    assert_eq!(found.url.path_name(), "/a");

    assert!(client
        .dirman
        .get_parent_info(&url("dir:/z/zz"))
        .unwrap()
        .is_none());
}

#[test]
fn client_hosts_through_root() {
    let root = Node::up(28630, None);
    let client = Node::up(28631, Some(root.dirman.my_node().to_hex()));

    let hosted = client
        .dirman
        .host_new_dir(DirectoryInfo::new(url("local:/scratch/pool")))
        .unwrap();
    assert_eq!(hosted.url.reference_node, client.dirman.my_node());

    // root answers for it now
    let seen = root
        .dirman
        .get_directory_info(&url("local:/scratch/pool"))
        .unwrap()
        .expect("root holds the hosted record");
    assert_eq!(seen.url.reference_node, client.dirman.my_node());

    // the dirman hook is live on both nodes
    for n in [&root, &client] {
        let (status, _) = nexus_whookie::http_get(
            Ipv4Addr::LOCALHOST,
            n.whookie.port(),
            "/dirman&format=text",
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(status, 200);
    }
}
