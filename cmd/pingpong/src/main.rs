//! Transport demo: two transports in one process exchange an eager message
//! and a rendezvous transfer over 127.0.0.1.

use std::net::Ipv4Addr;
use std::process::exit;
use std::sync::Arc;

use nexus_common::Configuration;
use nexus_nnti::sockets::SocketsTransport;
use nexus_nnti::{buffer_flags as bf, event_types, OpKind, WorkRequest};
use nexus_whookie::Server;

fn node(port: u16) -> (Arc<Server>, Arc<SocketsTransport>) {
    let whookie = Server::new();
    whookie
        .start(Ipv4Addr::LOCALHOST, port)
        .expect("control-plane bind failed");
    let transport = SocketsTransport::new(whookie.clone(), &Configuration::new())
        .expect("transport setup failed");
    transport.start().expect("transport start failed");
    (whookie, transport)
}

fn main() {
    let flags = bf::LOCAL_READ | bf::LOCAL_WRITE | bf::REMOTE_READ | bf::REMOTE_WRITE;

    let (wa, ta) = node(1990);
    let (wb, tb) = node(1991);
    println!("node A: {}", ta.get_url().unwrap());
    println!("node B: {}", tb.get_url().unwrap());

    let q = ta.eq_create(64, 0).expect("eq");
    let recv = ta.alloc(64 * 1024, flags, Some(q.clone()), None, 0).expect("recv buffer");
    let remote_form = ta.dt_pack_buffer(&recv);

    let peer = tb.connect(&ta.get_url().unwrap(), 2000).expect("connect");
    let src = tb.alloc(64 * 1024, flags, None, None, 0).expect("src buffer");
    let remote = tb.dt_unpack_buffer(&remote_form).expect("unpack");

    // a short eager message
    src.copy_in(0, b"ping (eager)").unwrap();
    let wr = WorkRequest {
        op: OpKind::Send,
        peer: Some(peer.clone()),
        local_hdl: Some(src.clone()),
        remote_hdl: Some(remote.clone()),
        length: 12,
        ..Default::default()
    };
    tb.send(&wr).expect("send");
    let (_, ev) = ta.eq_wait(&[q.clone()], 5000).expect("eager recv event");
    assert!(ev.event_type == event_types::RECV);
    println!(
        "A received {} bytes eager: {:?}",
        ev.length,
        String::from_utf8_lossy(&recv.read_bytes(ev.offset, ev.length).unwrap())
    );

    // a large rendezvous transfer
    let big: Vec<u8> = (0..8000u32).map(|i| (i % 251) as u8).collect();
    src.copy_in(100, &big).unwrap();
    let wr = WorkRequest {
        op: OpKind::Send,
        peer: Some(peer),
        local_hdl: Some(src),
        local_offset: 100,
        remote_hdl: Some(remote),
        remote_offset: 8,
        length: big.len() as u64,
        ..Default::default()
    };
    tb.send(&wr).expect("send");
    let (_, ev) = ta.eq_wait(&[q], 5000).expect("rendezvous recv event");
    let landed = recv.read_bytes(ev.offset, ev.length).unwrap();
    if landed != big {
        eprintln!("rendezvous payload mismatch");
        exit(-1);
    }
    println!("A received {} bytes by rendezvous, byte-exact", ev.length);

    tb.stop();
    ta.stop();
    wb.stop();
    wa.stop();
}
