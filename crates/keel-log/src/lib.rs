//! Leveled logging for the keel workspace.
//!
//! A single global logger filters messages by [`Level`]. The level starts out
//! from the `KEEL_LOG` environment variable (`error`, `warn`, `info`, `debug`,
//! `trace` or `off`) and falls back to [`DEFAULT_LEVEL`]. Messages go to
//! stderr, tagged with the module path of the call site.
//!
//! # Example
//!
//! ```
//! use keel_log::{debug, info, warn, Level};
//!
//! keel_log::set_level(Level::Debug);
//!
//! let committed = 8192;
//! info!("arena committed {} bytes", committed);
//! debug!("chunks: {:?}", [4096, 4096]);
//! warn!("decommit advice rejected");
//! ```

use std::fmt::{self, Arguments};
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

/// Environment variable consulted when the logger is first touched.
pub const ENV_VAR: &str = "KEEL_LOG";

/// Level used when `KEEL_LOG` is unset or unparsable.
pub const DEFAULT_LEVEL: Level = Level::Warn;

/// Log levels, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Failures the caller will see as an error.
    Error = 1,
    /// Degraded behavior that is not fatal.
    Warn = 2,
    /// Coarse lifecycle events.
    Info = 3,
    /// Resource acquisition and release.
    Debug = 4,
    /// Per-operation detail such as commit and decommit calls.
    Trace = 5,
}

impl Level {
    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Returns the upper-case name of this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Level::Error),
            2 => Some(Level::Warn),
            3 => Some(Level::Info),
            4 => Some(Level::Debug),
            5 => Some(Level::Trace),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError(String);

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {:?}", self.0)
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Level::Error),
            "warn" | "warning" => Ok(Level::Warn),
            "info" => Ok(Level::Info),
            "debug" => Ok(Level::Debug),
            "trace" => Ok(Level::Trace),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// Threshold value meaning "log nothing".
const OFF: u8 = 0;

/// The global logger.
///
/// Holds the active threshold as an atomic so it can be changed from any
/// thread at any time.
pub struct Logger {
    threshold: AtomicU8,
}

impl Logger {
    const fn new(threshold: u8) -> Self {
        Logger {
            threshold: AtomicU8::new(threshold),
        }
    }

    /// Sets the most verbose level that will be emitted.
    pub fn set_level(&self, level: Level) {
        self.threshold.store(level as u8, Ordering::Relaxed);
    }

    /// Silences all output.
    pub fn disable(&self) {
        self.threshold.store(OFF, Ordering::Relaxed);
    }

    /// Returns the active level, or `None` when logging is off.
    pub fn level(&self) -> Option<Level> {
        Level::from_u8(self.threshold.load(Ordering::Relaxed))
    }

    /// Checks if a message at `level` would be emitted.
    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        (level as u8) <= self.threshold.load(Ordering::Relaxed)
    }
}

/// Resolves the starting threshold from the value of [`ENV_VAR`].
///
/// `off` and `none` disable logging; anything unparsable falls back to
/// [`DEFAULT_LEVEL`].
#[must_use]
pub fn threshold_from_env(value: Option<&str>) -> Option<Level> {
    match value {
        None => Some(DEFAULT_LEVEL),
        Some(v) if v.trim().eq_ignore_ascii_case("off") => None,
        Some(v) if v.trim().eq_ignore_ascii_case("none") => None,
        Some(v) => Some(v.parse().unwrap_or(DEFAULT_LEVEL)),
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the global logger, initializing it from `KEEL_LOG` on first use.
pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(|| {
        let env = std::env::var(ENV_VAR).ok();
        let threshold = threshold_from_env(env.as_deref()).map_or(OFF, |l| l as u8);
        Logger::new(threshold)
    })
}

/// Sets the level of the global logger.
pub fn set_level(level: Level) {
    get_logger().set_level(level);
}

/// Sets the level of the global logger from its name.
///
/// ```
/// keel_log::set_level_from_str("trace").unwrap();
/// assert!(keel_log::set_level_from_str("loud").is_err());
/// ```
pub fn set_level_from_str(s: &str) -> Result<(), ParseLevelError> {
    set_level(s.parse()?);
    Ok(())
}

#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments) {
    const RESET: &str = "\x1b[0m";

    if !get_logger().enabled(level) {
        return;
    }

    eprintln!("{}[{level}]{RESET} {target}: {args}", level.color_code());
}

/// Logs a message at an explicit level.
///
/// ```
/// use keel_log::{log, Level};
///
/// log!(level: Level::Info, "reserved {} bytes", 1 << 20);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {
        {
            let level = $level;
            if $crate::get_logger().enabled(level) {
                $crate::__log_with_target(level, module_path!(), format_args!($($arg)*));
            }
        }
    };
}

/// Logs at [`Level::Error`].
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs at [`Level::Warn`].
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs at [`Level::Info`].
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs at [`Level::Debug`].
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs at [`Level::Trace`].
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}
