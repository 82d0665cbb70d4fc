//! File logging for conductor.
//!
//! Level guide:
//! - ERROR: store or state machine violations surfaced to the caller
//! - WARN: validation rejections, transport retries, rollbacks, aborts
//! - INFO: workflow lifecycle (start, advance, completion)
//! - DEBUG: per-task dispatch, context writes, persistence
//! - TRACE: payload sizes and context closures
//!
//! Nothing is written until [`init`] has been called, so library users and
//! tests never touch the filesystem through the logger. `--debug` or
//! `CONDUCTOR_DEBUG=1` lowers the threshold to DEBUG; `CONDUCTOR_LOG=<level>`
//! sets it explicitly.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

/// Name of the log file created inside the data directory.
pub const LOG_FILE: &str = "conductor.log";

struct Sink {
    path: PathBuf,
    file: Mutex<File>,
}

static SINK: OnceLock<Sink> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

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

/// The threshold implied by the flag and environment.
fn resolve_threshold(debug: bool, env_debug: Option<&str>, env_level: Option<&str>) -> LogLevel {
    if let Some(level) = env_level.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = env_debug
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Start logging to `<data_dir>/conductor.log`, truncating it.
///
/// A second call only updates the threshold; the first file stays in use.
pub fn init(data_dir: &Path, debug: bool) {
    let level = resolve_threshold(
        debug,
        std::env::var("CONDUCTOR_DEBUG").ok().as_deref(),
        std::env::var("CONDUCTOR_LOG").ok().as_deref(),
    );
    set_level(level);

    if SINK.get().is_some() || std::fs::create_dir_all(data_dir).is_err() {
        return;
    }
    let path = data_dir.join(LOG_FILE);
    if let Ok(file) = File::create(&path) {
        let _ = SINK.set(Sink {
            path,
            file: Mutex::new(file),
        });
    }
}

pub fn set_level(level: LogLevel) {
    THRESHOLD.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(THRESHOLD.load(Ordering::Relaxed))
}

/// Path of the active log file, if logging was initialized.
pub fn path() -> Option<&'static Path> {
    SINK.get().map(|sink| sink.path.as_path())
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > self::level() {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    if let Ok(mut file) = sink.file.lock() {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(file, "[{}] [{:<5}] {}", timestamp, level.as_str(), msg);
    }
}

/// Log macro for INFO level.
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// Log macro for DEBUG level (written only with `--debug` or a lower threshold).
#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
    };
}
