//! A simple logging utility for emitting messages based on severity levels.
//!
//! There is no global logger: components receive a [Logger] handle when they
//! are constructed. The default handle is disabled, so leaving logging
//! unconfigured never changes the behavior of the caller.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::{mem, time};

/// Default source of log messages.
const SOURCE: &str = "nbsock";

/// Logs a message at the [Level::Error] level through the given [Logger].
#[macro_export]
macro_rules! error {
    ($log:expr, $($arg:tt)+) => {{
        let log: &$crate::log::Logger = &$log;
        if log.enabled($crate::log::Level::Error) {
            log.log($crate::log::Level::Error, format!($($arg)+));
        }
    }};
}

/// Logs a message at the [Level::Warn] level through the given [Logger].
#[macro_export]
macro_rules! warn {
    ($log:expr, $($arg:tt)+) => {{
        let log: &$crate::log::Logger = &$log;
        if log.enabled($crate::log::Level::Warn) {
            log.log($crate::log::Level::Warn, format!($($arg)+));
        }
    }};
}

/// Logs a message at the [Level::Info] level through the given [Logger].
#[macro_export]
macro_rules! info {
    ($log:expr, $($arg:tt)+) => {{
        let log: &$crate::log::Logger = &$log;
        if log.enabled($crate::log::Level::Info) {
            log.log($crate::log::Level::Info, format!($($arg)+));
        }
    }};
}

/// Logs a message at the [Level::Debug] level through the given [Logger].
#[macro_export]
macro_rules! debug {
    ($log:expr, $($arg:tt)+) => {{
        let log: &$crate::log::Logger = &$log;
        if log.enabled($crate::log::Level::Debug) {
            log.log($crate::log::Level::Debug, format!($($arg)+));
        }
    }};
}

/// Severity levels for log messages, from most to least severe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Designates very serious errors.
    Error,
    /// Designates hazardous situations.
    Warn,
    /// Designates useful information.
    Info,
    /// Designates lower priority information.
    Debug,
}

impl Level {
    /// Maps a verbosity count (e.g., the number of `-v` flags) to a level.
    /// Zero means errors only.
    pub fn from_verbosity(count: usize) -> Self {
        match count {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            _ => Level::Debug,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Level::Error => "\x1b[1;31mERROR\x1b[0m",
            Level::Warn => "\x1b[1;33mWARN \x1b[0m",
            Level::Info => "\x1b[1;32mINFO \x1b[0m",
            Level::Debug => "\x1b[1;34mDEBUG\x1b[0m",
        }
    }
}

#[derive(Debug, Clone)]
enum Target {
    Std,
    File(Arc<Mutex<File>>),
}

/// Handle used to emit log messages.
///
/// Cloning a `Logger` is cheap; clones share the same output target.
#[derive(Debug, Clone)]
pub struct Logger {
    max: Option<Level>,
    source: &'static str,
    target: Target,
}

impl Default for Logger {
    /// Returns a disabled logger.
    fn default() -> Self {
        Self::disabled()
    }
}

impl Logger {
    /// Creates a logger that discards every message.
    pub fn disabled() -> Self {
        Self {
            max: None,
            source: SOURCE,
            target: Target::Std,
        }
    }

    /// Creates a logger emitting messages up to (and including) `max`.
    ///
    /// - [Level::Info] and [Level::Debug] messages are printed to `stdout`.
    /// - [Level::Warn] and [Level::Error] messages are printed to `stderr`.
    pub fn new(max: Level) -> Self {
        Self {
            max: Some(max),
            source: SOURCE,
            target: Target::Std,
        }
    }

    /// Creates a logger appending messages up to `max` to the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file could not be opened.
    pub fn to_file<P: AsRef<Path>>(max: Level, path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            max: Some(max),
            source: SOURCE,
            target: Target::File(Arc::new(Mutex::new(file))),
        })
    }

    /// Returns a copy of this logger that tags messages with `source`.
    pub fn with_source(mut self, source: &'static str) -> Self {
        self.source = source;
        self
    }

    /// Returns `true` if messages at `level` would be emitted.
    pub fn enabled(&self, level: Level) -> bool {
        self.max.is_some_and(|max| level <= max)
    }

    /// Logs a message with the specified severity level.
    ///
    /// The log message will include a timestamp, severity level, and the
    /// source of the log. Failures to write the message are ignored.
    pub fn log(&self, level: Level, msg: impl fmt::Display) {
        if !self.enabled(level) {
            return;
        }

        let timestamp = timestamp();
        let line = format!(
            "[\x1b[1;37m{timestamp}\x1b[0m] {} [\x1b[1;37m{}\x1b[0m] {msg}",
            level.label(),
            self.source
        );

        match self.target {
            Target::Std => match level {
                Level::Error | Level::Warn => eprintln!("{line}"),
                Level::Info | Level::Debug => println!("{line}"),
            },
            Target::File(ref file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = writeln!(file, "{line}");
                }
            }
        }
    }
}

fn timestamp() -> String {
    let now = time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let time = now as libc::time_t;
    let mut tm: libc::tm = unsafe { mem::zeroed() };

    if unsafe { libc::localtime_r(&time, &mut tm) }.is_null() {
        return "UNKNOWN".to_string();
    }

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}
