//! Leveled stderr logging for the nexus stack.
//!
//! Every record carries a component tag so interleaved output from the
//! progress thread, backburner workers and user threads can be told apart.
//!
//! # Environment Variables
//!
//! - `NEXUS_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `NEXUS_LOG_FLUSH=1` - flush stderr after each record (debugging crashes)
//! - `NEXUS_LOG_TIME=1` - include a nanosecond timestamp
//!
//! # Output Format
//!
//! `[LEVEL] [component] message`, with `[<ns>]` inserted when timestamps are on.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

/// Log levels, lowest to highest verbosity.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1") | Ok("true") | Ok("yes"))
}

/// Initialize logging from environment variables.
///
/// Called automatically on first log; callable explicitly for deterministic
/// startup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    START_TIME.get_or_init(Instant::now);

    FLUSH_ENABLED.store(env_flag("NEXUS_LOG_FLUSH"), Ordering::Relaxed);
    TIME_ENABLED.store(env_flag("NEXUS_LOG_TIME"), Ordering::Relaxed);

    if let Ok(val) = std::env::var("NEXUS_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

#[inline]
fn elapsed_ns() -> u64 {
    let start = START_TIME.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

/// Internal: leveled record with component tag.
#[doc(hidden)]
pub fn _nlog_impl(level: LogLevel, component: &str, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();

    let _ = write!(handle, "{} ", level.prefix());
    if TIME_ENABLED.load(Ordering::Relaxed) {
        let _ = write!(handle, "[{}] ", elapsed_ns());
    }
    let _ = write!(handle, "[{}] ", component);
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");

    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log: `nlog_error!("whookie", "bind failed: {}", e)`
#[macro_export]
macro_rules! nlog_error {
    ($comp:expr, $($arg:tt)*) => {{
        $crate::logging::_nlog_impl(
            $crate::logging::LogLevel::Error,
            $comp,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log with component tag
#[macro_export]
macro_rules! nlog_warn {
    ($comp:expr, $($arg:tt)*) => {{
        $crate::logging::_nlog_impl(
            $crate::logging::LogLevel::Warn,
            $comp,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log with component tag
#[macro_export]
macro_rules! nlog_info {
    ($comp:expr, $($arg:tt)*) => {{
        $crate::logging::_nlog_impl(
            $crate::logging::LogLevel::Info,
            $comp,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log with component tag
#[macro_export]
macro_rules! nlog_debug {
    ($comp:expr, $($arg:tt)*) => {{
        $crate::logging::_nlog_impl(
            $crate::logging::LogLevel::Debug,
            $comp,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log with component tag
#[macro_export]
macro_rules! nlog_trace {
    ($comp:expr, $($arg:tt)*) => {{
        $crate::logging::_nlog_impl(
            $crate::logging::LogLevel::Trace,
            $comp,
            format_args!($($arg)*)
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels_ordered() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_from_u8() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
        assert_eq!(LogLevel::from_u8(1), LogLevel::Error);
        assert_eq!(LogLevel::from_u8(4), LogLevel::Debug);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);
        nlog_error!("test", "error {}", "msg");
        nlog_warn!("test", "warn");
        nlog_info!("test", "info");
        nlog_debug!("test", "debug {}", 42);
        nlog_trace!("test", "trace");
    }
}
