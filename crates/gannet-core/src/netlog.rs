//! Process-wide leveled logging sink.
//!
//! The engine only publishes events; where they go is configurable at
//! runtime. Output is line-oriented to locked stderr so concurrent
//! reactor threads never interleave within a line.
//!
//! # Environment variables
//!
//! - `GANNET_LOG_LEVEL=<level>` — `debug`, `info`, `warning`, `error`,
//!   `critical`, or `off`
//! - `GANNET_LOG_FLUSH=1` — flush stderr after each line
//!
//! # Usage
//!
//! ```ignore
//! use gannet_core::{net_info, net_error};
//!
//! net_info!("listening on port {}", port);
//! net_error!("recv failed. session: {}, errno: {}", id, errno);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Severity, ascending.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
    Off = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warning,
            3 => LogLevel::Error,
            4 => LogLevel::Critical,
            _ => LogLevel::Off,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Info => "[INFO ]",
            LogLevel::Warning => "[WARN ]",
            LogLevel::Error => "[ERROR]",
            LogLevel::Critical => "[CRIT ]",
            LogLevel::Off => "",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize from environment variables.
///
/// Runs automatically on first log; call explicitly for deterministic
/// startup ordering.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("GANNET_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "debug" | "0" => LogLevel::Debug,
            "info" | "1" => LogLevel::Info,
            "warning" | "warn" | "2" => LogLevel::Warning,
            "error" | "3" => LogLevel::Error,
            "critical" | "4" => LogLevel::Critical,
            "off" => LogLevel::Off,
            _ => LogLevel::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("GANNET_LOG_FLUSH") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
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
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level >= log_level()
}

#[doc(hidden)]
pub fn _log_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

#[macro_export]
macro_rules! net_debug {
    ($($arg:tt)*) => {{
        $crate::netlog::_log_impl(
            $crate::netlog::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! net_info {
    ($($arg:tt)*) => {{
        $crate::netlog::_log_impl(
            $crate::netlog::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! net_warn {
    ($($arg:tt)*) => {{
        $crate::netlog::_log_impl(
            $crate::netlog::LogLevel::Warning,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! net_error {
    ($($arg:tt)*) => {{
        $crate::netlog::_log_impl(
            $crate::netlog::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! net_critical {
    ($($arg:tt)*) => {{
        $crate::netlog::_log_impl(
            $crate::netlog::LogLevel::Critical,
            format_args!($($arg)*)
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Critical);
    }

    // Single test for everything touching the process-wide level, so
    // parallel test threads never observe each other's settings.
    #[test]
    fn test_threshold_and_macros() {
        set_log_level(LogLevel::Warning);
        assert!(!level_enabled(LogLevel::Debug));
        assert!(!level_enabled(LogLevel::Info));
        assert!(level_enabled(LogLevel::Warning));
        assert!(level_enabled(LogLevel::Critical));

        set_log_level(LogLevel::Off);
        assert!(!level_enabled(LogLevel::Critical));
        net_debug!("d {}", 1);
        net_info!("i");
        net_warn!("w");
        net_error!("e");
        net_critical!("c");
    }
}
