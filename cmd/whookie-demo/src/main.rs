//! Control-plane demo: bring the server up through bootstrap, add a hook,
//! query it, then shut down.

use std::time::Duration;

use nexus_common::{bootstrap, Configuration};
use nexus_whookie::{hook, http_get, update_hook};

fn main() {
    nexus_whookie::bootstrap();

    let config = Configuration::from_str_literal(
        "whookie.address 127.0.0.1\n\
         whookie.app_name Whookie Demo\n",
    );
    bootstrap::start_with_config(&config).expect("startup failed");

    let me = bootstrap::get_node_id();
    println!("serving at {}", me.http_link());

    update_hook(
        "/hello",
        hook(|args, rs| {
            let who = args.get("name").map(String::as_str).unwrap_or("world");
            rs.raw(&format!("hello, {}", who));
        }),
    );

    let (status, body) = http_get(
        me.ip(),
        me.port(),
        "/hello&name=demo&format=text",
        Duration::from_secs(2),
    )
    .expect("self-request failed");
    println!("GET /hello -> {} {}", status, body.trim_end());

    let (status, _) = http_get(me.ip(), me.port(), "/&format=text", Duration::from_secs(2))
        .expect("self-request failed");
    println!("GET / -> {}", status);

    bootstrap::finish().expect("teardown failed");
}
