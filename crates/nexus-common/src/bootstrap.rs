//! Dependency-ordered component lifecycle.
//!
//! Components register themselves (usually from their crate's `bootstrap()`
//! helper) before anyone calls [`init`]. Init sorts the registrations into a
//! dependency-consistent order, runs every component's init in that order,
//! then [`start`] runs the starts, and [`finish`] unwinds in reverse order.
//!
//! Multiple subsystems may call init/finish independently; the calls are
//! reference-counted and only the last matching finish tears the stack down.
//! Registration after init is accepted as a no-op only when the component is
//! already known, so libraries that self-register can coexist with an
//! application that registers them explicitly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, OnceLock};

use crate::config::Configuration;
use crate::error::{CommonError, CommonResult};
use crate::nodeid::{NodeId, NODE_UNSPECIFIED};
use crate::{nlog_debug, nlog_warn};

/// A component managed by bootstrap.
///
/// Objects get registered once and then driven through
/// init → start → finish.
pub trait BootstrapComponent: Send {
    fn name(&self) -> String;
    /// `(required, optional)` component names that must come up first.
    fn dependencies(&self) -> (Vec<String>, Vec<String>);
    fn init(&mut self, config: &mut Configuration) -> CommonResult<()>;
    fn start(&mut self);
    fn finish(&mut self);
}

pub type InitFn = Box<dyn FnMut(&mut Configuration) -> CommonResult<()> + Send>;
pub type LifecycleFn = Box<dyn FnMut() + Send>;

enum Callbacks {
    Fns {
        init: InitFn,
        start: LifecycleFn,
        finish: LifecycleFn,
    },
    Component(Box<dyn BootstrapComponent>),
}

struct Registered {
    name: String,
    requires: Vec<String>,
    optional: Vec<String>,
    callbacks: Callbacks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Initialized,
    Started,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Uninitialized => "uninitialized",
            State::Initialized => "initialized",
            State::Started => "started",
        }
    }
}

struct BootstrapState {
    state: State,
    components: Vec<Registered>,
    configuration: Configuration,
    num_init_callers: i32,
    halt_on_shutdown: bool,
    status_on_shutdown: bool,
    sleep_seconds_before_shutdown: u64,
    node_id: NodeId,
}

impl BootstrapState {
    fn new() -> Self {
        BootstrapState {
            state: State::Uninitialized,
            components: Vec::new(),
            configuration: Configuration::new(),
            num_init_callers: 0,
            halt_on_shutdown: false,
            status_on_shutdown: false,
            sleep_seconds_before_shutdown: 0,
            node_id: NODE_UNSPECIFIED,
        }
    }
}

fn global() -> &'static Mutex<BootstrapState> {
    static G: OnceLock<Mutex<BootstrapState>> = OnceLock::new();
    G.get_or_init(|| Mutex::new(BootstrapState::new()))
}

fn register_inner(
    g: &mut BootstrapState,
    name: String,
    requires: Vec<String>,
    optional: Vec<String>,
    callbacks: Callbacks,
    allow_overwrites: bool,
) -> CommonResult<()> {
    // Registration after init is fine only when this component came through
    // the first time around (libraries hiding their registration in ctors).
    if g.state != State::Uninitialized {
        if g.components.iter().any(|c| c.name == name) {
            return Ok(());
        }
        return Err(CommonError::RegisterAfterInit(name));
    }

    if let Some(existing) = g.components.iter_mut().find(|c| c.name == name) {
        if !allow_overwrites {
            return Err(CommonError::DuplicateComponent(name));
        }
        existing.requires = requires;
        existing.optional = optional;
        existing.callbacks = callbacks;
        return Ok(());
    }

    g.components.push(Registered { name, requires, optional, callbacks });
    Ok(())
}

/// Register a component as an init/start/finish callable triple.
pub fn register_component(
    name: &str,
    requires: Vec<String>,
    optional: Vec<String>,
    init: InitFn,
    start: LifecycleFn,
    finish: LifecycleFn,
    allow_overwrites: bool,
) -> CommonResult<()> {
    let mut g = global().lock().unwrap();
    register_inner(
        &mut g,
        name.to_string(),
        requires,
        optional,
        Callbacks::Fns { init, start, finish },
        allow_overwrites,
    )
}

/// Register an object implementing [`BootstrapComponent`].
pub fn register(component: Box<dyn BootstrapComponent>, allow_overwrites: bool) -> CommonResult<()> {
    let name = component.name();
    let (requires, optional) = component.dependencies();
    let mut g = global().lock().unwrap();
    register_inner(
        &mut g,
        name,
        requires,
        optional,
        Callbacks::Component(component),
        allow_overwrites,
    )
}

pub fn has_component(name: &str) -> bool {
    let g = global().lock().unwrap();
    g.components.iter().any(|c| c.name == name)
}

pub fn get_state() -> State {
    global().lock().unwrap().state
}

pub fn get_number_of_users() -> i32 {
    global().lock().unwrap().num_init_callers
}

/// The node id of this process, set by the control-plane server during init.
pub fn get_node_id() -> NodeId {
    global().lock().unwrap().node_id
}

pub fn set_node_id(id: NodeId) {
    global().lock().unwrap().node_id = id;
}

/// A copy of the configuration bootstrap was initialized with.
pub fn get_configuration() -> Configuration {
    global().lock().unwrap().configuration.clone()
}

// -- dependency sorting -----------------------------------------------------

/// Build `deps[name] = required ∪ (optional ∩ known)`, verifying that every
/// required component exists.
fn expand_dependencies(
    components: &[Registered],
) -> CommonResult<BTreeMap<String, BTreeSet<String>>> {
    let known: BTreeSet<&str> = components.iter().map(|c| c.name.as_str()).collect();

    let mut lut = BTreeMap::new();
    for c in components {
        let mut deps = BTreeSet::new();
        for r in &c.requires {
            if !known.contains(r.as_str()) {
                return Err(CommonError::MissingDependency {
                    component: c.name.clone(),
                    dependency: r.clone(),
                });
            }
            deps.insert(r.clone());
        }
        for o in &c.optional {
            if known.contains(o.as_str()) {
                deps.insert(o.clone());
            }
        }
        lut.insert(c.name.clone(), deps);
    }
    Ok(lut)
}

/// Sort components into a dependency-consistent start order (stable: ties
/// break by registration order).
fn sort_components(components: &mut Vec<Registered>) -> CommonResult<()> {
    let mut lut = expand_dependencies(components)?;

    // Fixed point over set union: fold each parent's ancestors into ours
    // until nothing changes.
    let mut keep_going = true;
    while keep_going {
        keep_going = false;
        let names: Vec<String> = lut.keys().cloned().collect();
        for name in &names {
            let parents: Vec<String> = lut[name].iter().cloned().collect();
            let mut updated = lut[name].clone();
            for p in &parents {
                if let Some(pdeps) = lut.get(p) {
                    for d in pdeps {
                        if updated.insert(d.clone()) {
                            keep_going = true;
                        }
                    }
                }
            }
            lut.insert(name.clone(), updated);
        }
    }

    // Repeated insertion: place each component before the first entry whose
    // closure contains it, otherwise append.
    let mut sorted: Vec<Registered> = Vec::with_capacity(components.len());
    for c in components.drain(..) {
        let mut spot = None;
        for (i, s) in sorted.iter().enumerate() {
            if lut[&s.name].contains(&c.name) {
                spot = Some(i);
                break;
            }
        }
        match spot {
            Some(i) => sorted.insert(i, c),
            None => sorted.push(c),
        }
    }
    *components = sorted;
    Ok(())
}

/// The component names in the order they would start.
pub fn start_order() -> CommonResult<Vec<String>> {
    let mut g = global().lock().unwrap();
    sort_components(&mut g.components)?;
    Ok(g.components.iter().map(|c| c.name.clone()).collect())
}

/// `(state name, start order)` for the `/bootstraps` hook.
pub fn status_summary() -> (String, Vec<String>) {
    let g = global().lock().unwrap();
    (
        g.state.name().to_string(),
        g.components.iter().map(|c| c.name.clone()).collect(),
    )
}

// -- lifecycle --------------------------------------------------------------

/// Initialize every registered component with `config`.
///
/// Returns Ok(true) when this call performed the initialization, Ok(false)
/// when somebody else already had (their configuration stays in effect).
/// With `bootstrap.exit_on_errors` (the default) a failing component init
/// terminates the process; otherwise the error comes back to the caller.
pub fn init(config: &Configuration) -> CommonResult<bool> {
    crate::logging::init();

    let mut g = global().lock().unwrap();

    let current = g.num_init_callers;
    g.num_init_callers += 1;
    if current != 0 {
        nlog_warn!("bootstrap", "multiple init calls; using existing initialization");
        return Ok(false);
    }

    g.configuration = config.clone();

    let exit_on_errors = g
        .configuration
        .get_bool("bootstrap.exit_on_errors", "true")
        .unwrap_or(true);

    let fail = |e: CommonError| -> CommonError {
        if exit_on_errors {
            eprintln!("bootstrap init error: {}", e);
            std::process::exit(-1);
        }
        e
    };

    if let Err(e) = g.configuration.append_from_references() {
        return Err(fail(e));
    }

    let show_config = g.configuration.get_bool("bootstrap.show_config", "false").unwrap_or(false);
    g.halt_on_shutdown = g.configuration.get_bool("bootstrap.halt_on_shutdown", "false").unwrap_or(false);
    g.status_on_shutdown = g.configuration.get_bool("bootstrap.status_on_shutdown", "false").unwrap_or(false);
    g.sleep_seconds_before_shutdown = g
        .configuration
        .get_uint("bootstrap.sleep_seconds_before_shutdown", "0")
        .unwrap_or(0);

    // mpi-assisted rendezvous barriers are recognised but inert here
    if g.configuration.get_bool("mpisyncstart.enable", "false").unwrap_or(false) {
        nlog_warn!("bootstrap", "mpisyncstart.enable set but no mpi runtime is present; ignoring");
    }
    if g.configuration.get_bool("mpisyncstop.enable", "false").unwrap_or(false) {
        nlog_warn!("bootstrap", "mpisyncstop.enable set but no mpi runtime is present; ignoring");
    }

    nlog_debug!("bootstrap", "init ({} components known)", g.components.len());

    if let Err(e) = sort_components(&mut g.components) {
        return Err(fail(e));
    }

    let st = &mut *g;
    for c in st.components.iter_mut() {
        nlog_debug!("bootstrap", "initializing component {}", c.name);
        let r = match &mut c.callbacks {
            Callbacks::Fns { init, .. } => init(&mut st.configuration),
            Callbacks::Component(obj) => obj.init(&mut st.configuration),
        };
        if let Err(e) = r {
            let wrapped = CommonError::ComponentInit {
                component: c.name.clone(),
                detail: e.to_string(),
            };
            return Err(fail(wrapped));
        }
    }

    if show_config {
        println!("configuration after bootstrap init:\n{}", g.configuration.dump());
    }

    g.state = State::Initialized;
    Ok(true)
}

/// Start every component, in init order.
pub fn start() -> CommonResult<()> {
    let mut g = global().lock().unwrap();

    if g.state == State::Started {
        nlog_debug!("bootstrap", "already started, continuing");
        return Ok(());
    }
    if g.state != State::Initialized {
        return Err(CommonError::WrongState {
            wanted: "initialized",
            current: g.state.name(),
        });
    }

    for c in g.components.iter_mut() {
        nlog_debug!("bootstrap", "starting component {}", c.name);
        match &mut c.callbacks {
            Callbacks::Fns { start, .. } => start(),
            Callbacks::Component(obj) => obj.start(),
        }
    }
    g.state = State::Started;
    Ok(())
}

/// init + start in one call.
pub fn start_with_config(config: &Configuration) -> CommonResult<bool> {
    let we_initialized = init(config)?;
    if we_initialized {
        start()?;
    }
    Ok(we_initialized)
}

fn finish_impl(clear_registrations: bool) -> CommonResult<()> {
    let mut g = global().lock().unwrap();

    if g.state == State::Uninitialized {
        return Err(CommonError::WrongState {
            wanted: "initialized or started",
            current: g.state.name(),
        });
    }

    g.num_init_callers -= 1;
    if g.num_init_callers > 0 {
        nlog_debug!("bootstrap", "finish deferred; other users still active");
        return Ok(());
    }

    if g.halt_on_shutdown {
        if g.status_on_shutdown {
            dump_status(&g);
        }
        eprintln!("bootstrap finish called with halt_on_shutdown set");
        std::process::exit(-1);
    }

    // Some applications want a settling interval before teardown
    if g.sleep_seconds_before_shutdown > 0 {
        std::thread::sleep(std::time::Duration::from_secs(g.sleep_seconds_before_shutdown));
    }

    if g.state == State::Started {
        for c in g.components.iter_mut().rev() {
            nlog_debug!("bootstrap", "finishing component {}", c.name);
            match &mut c.callbacks {
                Callbacks::Fns { finish, .. } => finish(),
                Callbacks::Component(obj) => obj.finish(),
            }
        }
    }
    g.state = State::Uninitialized;

    if clear_registrations {
        g.components.clear();
    }
    if g.status_on_shutdown {
        dump_status(&g);
    }
    Ok(())
}

/// Tear down (last user only) and clear all registrations.
pub fn finish() -> CommonResult<()> {
    finish_impl(true)
}

/// Tear down but keep the registration list, so the same stack can be
/// brought up again with another init.
pub fn finish_keep_registrations() -> CommonResult<()> {
    finish_impl(false)
}

fn dump_status(g: &BootstrapState) {
    println!("node url: {}", g.node_id.http_link());
    println!("bootstrap state: {}", g.state.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // The bootstrap singleton is process-wide; serialize the tests that
    // drive it.
    fn test_lock() -> std::sync::MutexGuard<'static, ()> {
        static L: Mutex<()> = Mutex::new(());
        match L.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn hard_reset() {
        let mut g = global().lock().unwrap();
        *g = BootstrapState::new();
    }

    fn noop_fns() -> (InitFn, LifecycleFn, LifecycleFn) {
        (Box::new(|_| Ok(())), Box::new(|| {}), Box::new(|| {}))
    }

    fn marker_fns(log: &Arc<Mutex<Vec<String>>>, name: &str) -> (InitFn, LifecycleFn, LifecycleFn) {
        let (l1, l2) = (log.clone(), log.clone());
        let (n1, n2) = (format!("{}.init", name), format!("{}.fin", name));
        (
            Box::new(move |_| {
                l1.lock().unwrap().push(n1.clone());
                Ok(())
            }),
            Box::new(|| {}),
            Box::new(move || {
                l2.lock().unwrap().push(n2.clone());
            }),
        )
    }

    #[test]
    fn test_dependency_order() {
        let _l = test_lock();
        hard_reset();

        // register out of order: D requires C, C requires B and A, B requires A
        for (name, reqs) in [
            ("d", vec!["c"]),
            ("b", vec!["a"]),
            ("c", vec!["b", "a"]),
            ("a", vec![]),
        ] {
            let (i, s, f) = noop_fns();
            register_component(
                name,
                reqs.into_iter().map(String::from).collect(),
                vec![],
                i,
                s,
                f,
                false,
            )
            .unwrap();
        }

        let order = start_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        hard_reset();
    }

    #[test]
    fn test_init_finish_marker_sequence() {
        let _l = test_lock();
        hard_reset();

        let log = Arc::new(Mutex::new(Vec::new()));
        for (name, reqs) in [
            ("b", vec!["a"]),
            ("a", vec![]),
            ("d", vec!["c"]),
            ("c", vec!["b", "a"]),
        ] {
            let (i, s, f) = marker_fns(&log, name);
            register_component(
                name,
                reqs.into_iter().map(String::from).collect(),
                vec![],
                i,
                s,
                f,
                false,
            )
            .unwrap();
        }

        let c = Configuration::new();
        assert!(start_with_config(&c).unwrap());
        finish().unwrap();

        let seq = log.lock().unwrap().clone();
        assert_eq!(
            seq,
            vec!["a.init", "b.init", "c.init", "d.init", "d.fin", "c.fin", "b.fin", "a.fin"]
        );
        hard_reset();
    }

    #[test]
    fn test_missing_dependency_fails() {
        let _l = test_lock();
        hard_reset();

        let (i, s, f) = noop_fns();
        register_component("lonely", vec!["ghost".to_string()], vec![], i, s, f, false).unwrap();
        let err = start_order().unwrap_err();
        assert!(matches!(err, CommonError::MissingDependency { .. }));
        hard_reset();
    }

    #[test]
    fn test_optional_dependency_used_when_present() {
        let _l = test_lock();
        hard_reset();

        let (i, s, f) = noop_fns();
        register_component("x", vec![], vec!["y".to_string()], i, s, f, false).unwrap();
        // y missing: fine
        assert_eq!(start_order().unwrap(), vec!["x"]);

        let (i, s, f) = noop_fns();
        register_component("y", vec![], vec![], i, s, f, false).unwrap();
        assert_eq!(start_order().unwrap(), vec!["y", "x"]);
        hard_reset();
    }

    #[test]
    fn test_double_register() {
        let _l = test_lock();
        hard_reset();

        let (i, s, f) = noop_fns();
        register_component("dup", vec![], vec![], i, s, f, false).unwrap();

        let (i, s, f) = noop_fns();
        assert!(matches!(
            register_component("dup", vec![], vec![], i, s, f, false),
            Err(CommonError::DuplicateComponent(_))
        ));

        let (i, s, f) = noop_fns();
        register_component("dup", vec![], vec![], i, s, f, true).unwrap();
        hard_reset();
    }

    #[test]
    fn test_refcounted_users() {
        let _l = test_lock();
        hard_reset();

        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        register_component(
            "counted",
            vec![],
            vec![],
            Box::new(|_| Ok(())),
            Box::new(|| {}),
            Box::new(move || {
                c1.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        )
        .unwrap();

        let c = Configuration::new();
        assert!(start_with_config(&c).unwrap());
        assert!(!start_with_config(&c).unwrap());
        assert_eq!(get_number_of_users(), 2);

        finish().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0, "first finish must not tear down");
        assert_eq!(get_state(), State::Started);

        finish().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(get_state(), State::Uninitialized);
        hard_reset();
    }

    #[test]
    fn test_init_finish_twice_is_clean() {
        let _l = test_lock();
        hard_reset();

        for _ in 0..2 {
            let (i, s, f) = noop_fns();
            register_component("cycle", vec![], vec![], i, s, f, false).unwrap();
            let c = Configuration::new();
            assert!(start_with_config(&c).unwrap());
            finish().unwrap();
            assert_eq!(get_state(), State::Uninitialized);
            assert!(!has_component("cycle"));
        }
        hard_reset();
    }

    #[test]
    fn test_register_after_init() {
        let _l = test_lock();
        hard_reset();

        let (i, s, f) = noop_fns();
        register_component("early", vec![], vec![], i, s, f, false).unwrap();
        let c = Configuration::new();
        assert!(start_with_config(&c).unwrap());

        // re-register of a known component: accepted as a no-op
        let (i, s, f) = noop_fns();
        assert!(register_component("early", vec![], vec![], i, s, f, false).is_ok());

        // brand new component after init: refused
        let (i, s, f) = noop_fns();
        assert!(matches!(
            register_component("late", vec![], vec![], i, s, f, false),
            Err(CommonError::RegisterAfterInit(_))
        ));

        finish().unwrap();
        hard_reset();
    }

    #[test]
    fn test_component_object_registration() {
        let _l = test_lock();
        hard_reset();

        struct Probe {
            log: Arc<Mutex<Vec<&'static str>>>,
        }
        impl BootstrapComponent for Probe {
            fn name(&self) -> String {
                "probe".to_string()
            }
            fn dependencies(&self) -> (Vec<String>, Vec<String>) {
                (vec![], vec![])
            }
            fn init(&mut self, _config: &mut Configuration) -> CommonResult<()> {
                self.log.lock().unwrap().push("init");
                Ok(())
            }
            fn start(&mut self) {
                self.log.lock().unwrap().push("start");
            }
            fn finish(&mut self) {
                self.log.lock().unwrap().push("finish");
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        register(Box::new(Probe { log: log.clone() }), false).unwrap();

        let c = Configuration::new();
        start_with_config(&c).unwrap();
        finish().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["init", "start", "finish"]);
        hard_reset();
    }

    #[test]
    fn test_component_init_error_surfaces() {
        let _l = test_lock();
        hard_reset();

        register_component(
            "broken",
            vec![],
            vec![],
            Box::new(|_| Err(CommonError::ConfigFile("nope".to_string()))),
            Box::new(|| {}),
            Box::new(|| {}),
            false,
        )
        .unwrap();

        let c = Configuration::from_str_literal("bootstrap.exit_on_errors false\n");
        let err = init(&c).unwrap_err();
        assert!(matches!(err, CommonError::ComponentInit { .. }));
        hard_reset();
    }
}
