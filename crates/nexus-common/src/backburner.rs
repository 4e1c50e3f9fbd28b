//! Tag-serialized background workers.
//!
//! Work items are closures keyed by a 32-bit tag; all work for a given tag
//! lands on the same worker (`tag % threads`) and runs serially in
//! submission order. That per-tag serialization is the property the op
//! dispatcher builds on.
//!
//! Workers block between batches. The notification method is configurable:
//! `pipe` (default, blocking read of a self-pipe), `polling` (spin), or
//! `sleep_polling` (spin with a sleep). Registering a polling function on a
//! worker disables blocking on that worker so the function keeps running.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::config::Configuration;
use crate::error::{CommonError, CommonResult};
use crate::{nlog_debug, nlog_error};

pub type WorkFn = Box<dyn FnOnce() + Send>;
pub type PollFn = Box<dyn FnMut() + Send>;

enum NotifyMethod {
    Polling,
    SleepPolling(u64),
    Pipe { read_fd: RawFd, write_fd: RawFd },
}

impl NotifyMethod {
    fn notify(&self) {
        if let NotifyMethod::Pipe { write_fd, .. } = self {
            let token: u32 = 1;
            // Nonblocking write; a full pipe already holds enough wakeups.
            unsafe {
                libc::write(*write_fd, &token as *const u32 as *const libc::c_void, 4);
            }
        }
    }

    fn block_until_work(&self) {
        match self {
            NotifyMethod::Polling => {}
            NotifyMethod::SleepPolling(us) => {
                thread::sleep(std::time::Duration::from_micros(*us));
            }
            NotifyMethod::Pipe { read_fd, .. } => {
                let mut token: u32 = 0;
                loop {
                    let n = unsafe {
                        libc::read(*read_fd, &mut token as *mut u32 as *mut libc::c_void, 4)
                    };
                    if n == 4 {
                        break;
                    }
                    if n < 0 {
                        let errno = crate::error::last_errno();
                        if errno == libc::EINTR {
                            continue;
                        }
                    }
                    break;
                }
            }
        }
    }
}

impl Drop for NotifyMethod {
    fn drop(&mut self) {
        if let NotifyMethod::Pipe { read_fd, write_fd } = self {
            unsafe {
                libc::close(*read_fd);
                libc::close(*write_fd);
            }
        }
    }
}

fn make_pipe() -> CommonResult<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(CommonError::Os(crate::error::last_errno()));
    }
    unsafe {
        let flags = libc::fcntl(fds[1], libc::F_GETFL);
        libc::fcntl(fds[1], libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
    Ok((fds[0], fds[1]))
}

struct WorkerShared {
    tasks: Mutex<VecDeque<WorkFn>>,
    poll_fns: Mutex<Vec<(String, Option<PollFn>)>>,
    kill: AtomicBool,
    notify: NotifyMethod,
}

impl WorkerShared {
    fn add_work(&self, work: WorkFn) {
        self.tasks.lock().unwrap().push_back(work);
        self.notify.notify();
    }

    fn server(&self) {
        loop {
            if self.kill.load(Ordering::Relaxed) {
                break;
            }

            // With polling functions registered we must keep cycling; the
            // blocking read would starve them.
            let have_poll_fns = !self.poll_fns.lock().unwrap().is_empty();
            if !have_poll_fns {
                self.notify.block_until_work();
                if self.kill.load(Ordering::Relaxed) {
                    break;
                }
            }

            loop {
                let task = self.tasks.lock().unwrap().pop_front();
                match task {
                    Some(t) => t(),
                    None => break,
                }
            }

            {
                let mut fns = self.poll_fns.lock().unwrap();
                for (_, f) in fns.iter_mut() {
                    if let Some(f) = f {
                        f();
                    }
                }
            }

            if have_poll_fns {
                thread::yield_now();
            }
        }
    }
}

struct Worker {
    shared: Arc<WorkerShared>,
    handle: Option<thread::JoinHandle<()>>,
}

struct Backburner {
    workers: Vec<Worker>,
}

static BACKBURNER: Mutex<Option<Backburner>> = Mutex::new(None);

fn make_notify(config: &Configuration) -> CommonResult<NotifyMethod> {
    let method = config.get_lowercase_string("backburner.notification_method", "pipe");
    match method.as_str() {
        "polling" => Ok(NotifyMethod::Polling),
        "sleep_polling" => {
            let us = config.get_time_us("backburner.sleep_polling_time", "100us")?;
            Ok(NotifyMethod::SleepPolling(us))
        }
        "pipe" => {
            let (r, w) = make_pipe()?;
            Ok(NotifyMethod::Pipe { read_fd: r, write_fd: w })
        }
        other => Err(CommonError::BadConfigValue {
            key: "backburner.notification_method".to_string(),
            value: other.to_string(),
        }),
    }
}

/// Bring up the worker pool. Called from the bootstrap component's init.
pub fn configure(config: &Configuration) -> CommonResult<()> {
    let mut bb = BACKBURNER.lock().unwrap();
    if bb.is_some() {
        return Ok(());
    }

    let count = config.get_uint("backburner.threads", "1")?.max(1) as usize;
    let mut workers = Vec::with_capacity(count);
    for worker_id in 0..count {
        let shared = Arc::new(WorkerShared {
            tasks: Mutex::new(VecDeque::new()),
            poll_fns: Mutex::new(Vec::new()),
            kill: AtomicBool::new(false),
            notify: make_notify(config)?,
        });
        let s = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("backburner-{}", worker_id))
            .spawn(move || s.server())
            .expect("failed to spawn backburner worker");
        workers.push(Worker { shared, handle: Some(handle) });
    }

    nlog_debug!("backburner", "configured with {} worker(s)", count);
    *bb = Some(Backburner { workers });
    Ok(())
}

pub fn is_configured() -> bool {
    BACKBURNER.lock().unwrap().is_some()
}

/// Stop and join every worker.
pub fn shutdown() {
    // take() under the lock, join outside it, so in-flight tasks that call
    // add_work cannot deadlock against the join
    let taken = { BACKBURNER.lock().unwrap().take() };
    if let Some(mut b) = taken {
        for w in &b.workers {
            w.shared.kill.store(true, Ordering::SeqCst);
            w.shared.notify.notify();
        }
        for w in &mut b.workers {
            if let Some(h) = w.handle.take() {
                let _ = h.join();
            }
        }
    }
}

/// Queue work on the worker owning `tag`. All work sharing a tag is serial
/// and FIFO.
pub fn add_work(tag: u32, work: WorkFn) {
    let bb = BACKBURNER.lock().unwrap();
    match bb.as_ref() {
        Some(b) => {
            let idx = (tag as usize) % b.workers.len();
            b.workers[idx].shared.add_work(work);
        }
        None => {
            nlog_error!("backburner", "add_work with no configured workers; dropping task");
        }
    }
}

/// Untagged work goes to worker zero.
pub fn add_work_untagged(work: WorkFn) {
    add_work(0, work);
}

/// Register a function the worker owning `group_id` calls every cycle.
/// Disables notification blocking on that worker.
pub fn register_polling_function(name: &str, group_id: u32, f: PollFn) -> CommonResult<()> {
    let bb = BACKBURNER.lock().unwrap();
    let b = bb.as_ref().ok_or(CommonError::WrongState {
        wanted: "configured",
        current: "unconfigured",
    })?;
    let idx = (group_id as usize) % b.workers.len();
    let mut fns = b.workers[idx].shared.poll_fns.lock().unwrap();
    if fns.iter().any(|(n, _)| n == name) {
        return Err(CommonError::DuplicateComponent(name.to_string()));
    }
    fns.push((name.to_string(), Some(f)));
    // wake the worker so it notices it must stop blocking
    b.workers[idx].shared.notify.notify();
    Ok(())
}

/// Stop invoking a previously registered polling function (on any worker).
pub fn disable_polling_function(name: &str) {
    let bb = BACKBURNER.lock().unwrap();
    if let Some(b) = bb.as_ref() {
        for w in &b.workers {
            let mut fns = w.shared.poll_fns.lock().unwrap();
            for (n, f) in fns.iter_mut() {
                if n == name {
                    *f = None;
                }
            }
        }
    }
}

/// Register the backburner as a bootstrap component.
pub fn bootstrap() -> String {
    let _ = crate::bootstrap::register_component(
        "backburner",
        vec![],
        vec![],
        Box::new(|config: &mut Configuration| configure(config)),
        Box::new(|| {}),
        Box::new(shutdown),
        true,
    );
    "backburner".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_lock() -> std::sync::MutexGuard<'static, ()> {
        static L: Mutex<()> = Mutex::new(());
        match L.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn wait_for(pred: impl Fn() -> bool) {
        for _ in 0..2000 {
            if pred() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for backburner work");
    }

    #[test]
    fn test_work_runs() {
        let _l = test_lock();
        shutdown();
        configure(&Configuration::new()).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        add_work(7, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        wait_for(|| hits.load(Ordering::SeqCst) == 1);
        shutdown();
    }

    #[test]
    fn test_same_tag_is_fifo() {
        let _l = test_lock();
        shutdown();
        configure(&Configuration::from_str_literal("backburner.threads 4\n")).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100u32 {
            let l = log.clone();
            add_work(42, Box::new(move || {
                l.lock().unwrap().push(i);
            }));
        }
        wait_for(|| log.lock().unwrap().len() == 100);
        let seq = log.lock().unwrap().clone();
        assert_eq!(seq, (0..100).collect::<Vec<u32>>());
        shutdown();
    }

    #[test]
    fn test_polling_function_cycles() {
        let _l = test_lock();
        shutdown();
        configure(&Configuration::new()).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        register_polling_function("test_poller", 0, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        wait_for(|| hits.load(Ordering::SeqCst) > 3);
        disable_polling_function("test_poller");
        shutdown();
    }

    #[test]
    fn test_sleep_polling_method() {
        let _l = test_lock();
        shutdown();
        configure(&Configuration::from_str_literal(
            "backburner.notification_method sleep_polling\n\
             backburner.sleep_polling_time 100us\n",
        ))
        .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        add_work(0, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        wait_for(|| hits.load(Ordering::SeqCst) == 1);
        shutdown();
    }
}
