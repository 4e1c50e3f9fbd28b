//! The whole stack through bootstrap: configuration → control plane →
//! transport → dispatcher → directory manager, up in dependency order and
//! down in reverse.

use std::time::Duration;

use nexus_common::dirinfo::DirectoryInfo;
use nexus_common::url::ResourceUrl;
use nexus_common::Configuration;

fn position(order: &[String], name: &str) -> usize {
    order
        .iter()
        .position(|n| n == name)
        .unwrap_or_else(|| panic!("{} missing from start order {:?}", name, order))
}

#[test]
fn bootstrap_brings_the_whole_stack_up() {
    // registering the top component pulls in everything beneath it
    nexus_dirman::bootstrap();

    let config = Configuration::from_str_literal(
        "whookie.address 127.0.0.1\n\
         whookie.port 28650\n\
         backburner.threads 2\n",
    );
    nexus_common::bootstrap::start_with_config(&config).unwrap();

    let (state, order) = nexus_common::bootstrap::status_summary();
    assert_eq!(state, "started");
    assert!(position(&order, "whookie") < position(&order, "nnti"));
    assert!(position(&order, "nnti") < position(&order, "opbox"));
    assert!(position(&order, "backburner") < position(&order, "opbox"));
    assert!(position(&order, "opbox") < position(&order, "dirman"));

    let me = nexus_common::bootstrap::get_node_id();
    assert!(me.valid());

    let transport = nexus_nnti::transport().expect("transport singleton");
    assert!(transport.is_started());
    assert!(transport.get_url().unwrap().starts_with("sockets://127.0.0.1:"));

    let dispatcher = nexus_opbox::dispatcher().expect("dispatcher singleton");
    assert_eq!(dispatcher.my_node(), me);

    // with no configured root this node is its own directory authority
    let dm = nexus_dirman::dirman().expect("dirman singleton");
    assert!(dm.am_root());
    dm.host_new_dir(DirectoryInfo::new(ResourceUrl::parse("dht:/pool").unwrap()))
        .unwrap();
    let di = dm
        .get_directory_info(&ResourceUrl::parse("dht:/pool").unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(di.url.path_name(), "/pool");
    let joined = dm
        .join_dir(&ResourceUrl::parse("dht:/pool").unwrap(), "")
        .unwrap()
        .unwrap();
    assert_eq!(joined.members.len(), 1);

    // every layer's hooks answer on the shared control plane
    for path in ["/bootstraps", "/nnti/sockets/stats", "/nnti/sockets/peers", "/opbox", "/dirman"] {
        let target = format!("{}&format=text", path);
        let (status, _) =
            nexus_whookie::http_get(me.ip(), me.port(), &target, Duration::from_secs(2)).unwrap();
        assert_eq!(status, 200, "{} must answer while started", path);
    }

    nexus_common::bootstrap::finish().unwrap();
    assert_eq!(nexus_common::bootstrap::get_state(), nexus_common::bootstrap::State::Uninitialized);
    assert!(nexus_nnti::transport().is_none());
    assert!(nexus_opbox::dispatcher().is_none());
    assert!(nexus_dirman::dirman().is_none());
}
