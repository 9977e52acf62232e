//! Logging Infrastructure
//!
//! Leveled diagnostics for the runtime. The module is deliberately
//! self-contained (no `log` facade, no allocator-dependent backend): it
//! must be callable from below the allocator, e.g. while a thread-local
//! memory source is still being bootstrapped.
//!
//! Messages carry a coarse timestamp (seconds since runtime start) and,
//! when emitted from a worker thread, a `node.worker` prefix.
//!
//! # Example
//!
//! ```rust,ignore
//! log_debug!("created MemSource \"{}\" on node {}", name, node);
//! log_critical!("prefaulted {} of {} requested bytes", got, want);
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Log level. Lower values are more verbose; a message is emitted when
/// its level is >= the configured level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Fine-grained scheduling and allocation events.
    Info = 0,
    /// Lifecycle events (source creation, worker start/stop).
    Debug = 1,
    /// Conditions that deserve attention (default).
    Critical = 2,
    /// No logging.
    None = 3,
}

impl LogLevel {
    /// Parse a `NUMA_DEBUG` value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(LogLevel::Info),
            "DEBUG" => Some(LogLevel::Debug),
            "CRITICAL" => Some(LogLevel::Critical),
            "NONE" => Some(LogLevel::None),
            _ => None,
        }
    }

    /// Level name as written by the user.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Critical => "CRITICAL",
            LogLevel::None => "NONE",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configured threshold, cached as a plain atomic for cheap checks.
static THRESHOLD: AtomicU8 = AtomicU8::new(u8::MAX);

fn threshold() -> u8 {
    let t = THRESHOLD.load(Ordering::Relaxed);
    if t != u8::MAX {
        return t;
    }
    let level = crate::config::get().log_level as u8;
    THRESHOLD.store(level, Ordering::Relaxed);
    level
}

/// Would a message at `level` currently be emitted?
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level as u8 >= threshold() && level != LogLevel::None
}

fn start_time() -> &'static Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now)
}

/// Emit a message. Use through the `log_*!` macros.
pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }

    let elapsed = start_time().elapsed();
    let stderr = std::io::stderr();
    let mut out = stderr.lock();

    // Worker threads tag their output with "node.worker".
    let _ = match crate::task::worker::current_worker_tag() {
        Some((node, worker)) => writeln!(
            out,
            "[{:3}.{:03}] {:2}.{:02}: {}",
            elapsed.as_secs(),
            elapsed.subsec_millis(),
            node,
            worker,
            args
        ),
        None => writeln!(
            out,
            "[{:3}.{:03}] {}",
            elapsed.as_secs(),
            elapsed.subsec_millis(),
            args
        ),
    };
}

/// Log at `Info` level.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Info, format_args!($($arg)*))
    };
}

/// Log at `Debug` level.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Debug, format_args!($($arg)*))
    };
}

/// Log at `Critical` level.
#[macro_export]
macro_rules! log_critical {
    ($($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Critical, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("CRITICAL"), Some(LogLevel::Critical));
        assert_eq!(LogLevel::parse("NONE"), Some(LogLevel::None));
        assert_eq!(LogLevel::parse("info"), None);
        assert_eq!(LogLevel::parse(""), None);
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Critical);
        assert!(LogLevel::Critical < LogLevel::None);
    }

    #[test]
    fn test_none_never_enabled() {
        assert!(!enabled(LogLevel::None));
    }
}
