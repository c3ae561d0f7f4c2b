//! Diagnostics written to stderr, gated by a per-process level.
//!
//! Configuration is read once from the environment on first use:
//! `CORIO_LOG_LEVEL` names the threshold (`off`/`error`/`warn`/`info`/
//! `debug`/`trace`, or the equivalent digit), `CORIO_FLUSH_LOG` forces a
//! flush after every line. Lines look like `corio:warn: <message>`.
//!
//! The macros check the threshold before formatting, so disabled levels
//! cost a single atomic load.

use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

const NAMES: [(&str, LogLevel); 6] = [
    ("off", LogLevel::Off),
    ("error", LogLevel::Error),
    ("warn", LogLevel::Warn),
    ("info", LogLevel::Info),
    ("debug", LogLevel::Debug),
    ("trace", LogLevel::Trace),
];

impl LogLevel {
    /// Parse a level name or digit. Unknown input yields `None` and the
    /// caller keeps its default.
    pub fn parse(input: &str) -> Option<LogLevel> {
        let input = input.trim();
        NAMES
            .iter()
            .enumerate()
            .find(|(idx, (name, _))| {
                input.eq_ignore_ascii_case(name) || input.parse::<usize>() == Ok(*idx)
            })
            .map(|(_, (_, level))| *level)
    }

    /// Short tag spliced into the line framing.
    pub fn tag(self) -> &'static str {
        NAMES[self as usize].0
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false" | "no" | "off")
}

struct LogConfig {
    threshold: AtomicU8,
    flush: bool,
}

impl LogConfig {
    fn from_env() -> Self {
        let threshold = std::env::var("CORIO_LOG_LEVEL")
            .ok()
            .and_then(|v| LogLevel::parse(&v))
            .unwrap_or(LogLevel::Warn);
        let flush = std::env::var("CORIO_FLUSH_LOG")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        Self {
            threshold: AtomicU8::new(threshold as u8),
            flush,
        }
    }
}

static CONFIG: OnceLock<LogConfig> = OnceLock::new();

fn config() -> &'static LogConfig {
    CONFIG.get_or_init(LogConfig::from_env)
}

/// Force configuration now instead of on the first log line.
pub fn init() {
    let _ = config();
}

/// Override the threshold at runtime (tests silence output this way).
pub fn set_log_level(level: LogLevel) {
    config().threshold.store(level as u8, Ordering::Relaxed);
}

/// Whether a line at `level` would currently be written.
pub fn enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 <= config().threshold.load(Ordering::Relaxed)
}

/// Emit one framed line. The line is assembled up front and written with
/// a single call while holding the stderr lock, so concurrent writers
/// cannot interleave mid-line.
#[doc(hidden)]
pub fn write_line(level: LogLevel, message: &str) {
    let line = format!("corio:{}: {}\n", level.tag(), message);
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(line.as_bytes());
    if config().flush {
        let _ = stderr.flush();
    }
}

/// Log at an explicit level; the leveled macros below delegate here.
#[macro_export]
macro_rules! co_log {
    ($level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::log::enabled(level) {
            $crate::log::write_line(level, &format!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! co_error {
    ($($arg:tt)*) => { $crate::co_log!($crate::log::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! co_warn {
    ($($arg:tt)*) => { $crate::co_log!($crate::log::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! co_info {
    ($($arg:tt)*) => { $crate::co_log!($crate::log::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! co_debug {
    ($($arg:tt)*) => { $crate::co_log!($crate::log::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! co_trace {
    ($($arg:tt)*) => { $crate::co_log!($crate::log::LogLevel::Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_names_case_insensitively() {
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("  Error "), Some(LogLevel::Error));
    }

    #[test]
    fn parse_accepts_digits() {
        assert_eq!(LogLevel::parse("0"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("3"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("5"), Some(LogLevel::Trace));
    }

    #[test]
    fn parse_rejects_unknown_input() {
        assert_eq!(LogLevel::parse(""), None);
        assert_eq!(LogLevel::parse("verbose"), None);
        assert_eq!(LogLevel::parse("9"), None);
    }

    #[test]
    fn tags_match_level_names() {
        assert_eq!(LogLevel::Error.tag(), "error");
        assert_eq!(LogLevel::Trace.tag(), "trace");
    }

    #[test]
    fn flag_parsing_defaults_on_for_set_values() {
        assert!(parse_flag("1"));
        assert!(parse_flag("yes"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(" "));
    }

    #[test]
    fn threshold_gates_levels() {
        set_log_level(LogLevel::Info);
        assert!(enabled(LogLevel::Error));
        assert!(enabled(LogLevel::Info));
        assert!(!enabled(LogLevel::Debug));

        set_log_level(LogLevel::Off);
        assert!(!enabled(LogLevel::Error));
        // Off itself is never writable.
        assert!(!enabled(LogLevel::Off));
    }

    #[test]
    fn macros_expand_at_every_level() {
        set_log_level(LogLevel::Off);
        co_error!("error {}", 1);
        co_warn!("warn");
        co_info!("info");
        co_debug!("debug");
        co_trace!("trace");
        co_log!(LogLevel::Trace, "explicit {}", "level");
    }
}
