//! Bootstrap ordering demo.
//!
//! Registers four components out of order, lets the dependency sort put
//! them right, then runs a full init/start/finish cycle with markers so the
//! ordering is visible.

use nexus_common::bootstrap;
use nexus_common::Configuration;

fn register(name: &'static str, requires: Vec<String>) {
    bootstrap::register_component(
        name,
        requires,
        vec![],
        Box::new(move |_config| {
            println!("  init   {}", name);
            Ok(())
        }),
        Box::new(move || println!("  start  {}", name)),
        Box::new(move || println!("  finish {}", name)),
        false,
    )
    .expect("registration failed");
}

fn main() {
    // deliberately registered out of order
    register("d", vec!["c".to_string()]);
    register("b", vec!["a".to_string()]);
    register("c", vec!["b".to_string(), "a".to_string()]);
    register("a", vec![]);

    let order = bootstrap::start_order().expect("dependency sort failed");
    println!("computed start order: {:?}", order);

    let config = Configuration::from_str_literal("bootstrap.exit_on_errors true\n");
    println!("bringing the stack up:");
    bootstrap::start_with_config(&config).expect("startup failed");

    println!("tearing it down (reverse order):");
    bootstrap::finish().expect("teardown failed");
}
