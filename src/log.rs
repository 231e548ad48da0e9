//! File logging for batch runs.
//!
//! Log levels:
//! - ERROR: Batch-fatal failures (cycles, unreadable task lists)
//! - WARN: Recoverable anomalies (stale locks reclaimed, workers going offline,
//!   at-least-once reassignments, escalations)
//! - INFO: Batch and level lifecycle
//! - DEBUG: Every task state transition, lock and workspace operation
//! - TRACE: Scheduler loop internals
//!
//! `--debug` or `MAESTRO_DEBUG=1` raises the level to DEBUG; `MAESTRO_LOG`
//! (`error`..`trace`) sets it explicitly and wins over both. Nothing is
//! written until [`init_at`] has been called, so library users and tests
//! stay silent by default.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};

/// Log file name inside the state directory.
pub const LOG_FILE_NAME: &str = "maestro.log";

struct Sink {
    path: PathBuf,
    file: Mutex<File>,
}

static SINK: OnceLock<Sink> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Resolve the effective level from the CLI flag and environment values.
fn resolve_level(debug_flag: bool, env_debug: Option<&str>, env_level: Option<&str>) -> LogLevel {
    if let Some(level) = env_level.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = env_debug
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if debug_flag || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Start logging to `<state_dir>/maestro.log`, truncating any previous run.
/// Only the first call takes effect.
pub fn init_at(state_dir: &Path, debug: bool) {
    let level = resolve_level(
        debug,
        std::env::var("MAESTRO_DEBUG").ok().as_deref(),
        std::env::var("MAESTRO_LOG").ok().as_deref(),
    );
    set_level(level);

    if SINK.get().is_some() {
        return;
    }
    let _ = std::fs::create_dir_all(state_dir);
    let path = state_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path);
    if let Ok(file) = file {
        let _ = SINK.set(Sink {
            path,
            file: Mutex::new(file),
        });
    }
}

/// Path of the active log file, if logging was initialized.
pub fn log_path() -> Option<&'static Path> {
    SINK.get().map(|s| s.path.as_path())
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn current_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

fn format_line(now: DateTime<Utc>, level: LogLevel, msg: &str) -> String {
    format!(
        "{} {:<5} {}",
        now.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        level.as_str(),
        msg
    )
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > current_level() {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    let line = format_line(Utc::now(), level, msg);
    if let Ok(mut file) = sink.file.lock() {
        let _ = writeln!(file, "{}", line);
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

#[macro_export]
macro_rules! mlog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! mlog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! mlog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Only written at DEBUG and above.
#[macro_export]
macro_rules! mlog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! mlog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
