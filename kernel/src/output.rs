//! Logging sink plumbing for the driver framework.
//!
//! The level macros in [`macros`] format their arguments and hand them to a
//! single process-wide [`LogSink`]. The sink is installed once during early
//! boot (normally [`crate::serial::SerialSink`]); messages emitted before that
//! are dropped.

pub mod macros;

use core::fmt;

use conquer_once::spin::OnceCell;

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    /// Colored prefix written in front of every line of this level.
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Error => "\x1B[31mERROR:\x1B[0m",
            Level::Warn => "\x1B[33mWARN:\x1B[0m",
            Level::Info => "\x1B[32mINFO:\x1B[0m",
            Level::Debug => "\x1B[32mDEBUG:\x1B[0m",
            Level::Trace => "\x1B[36mTRACE:\x1B[0m",
        }
    }
}

/// Destination for formatted log lines.
///
/// Implementations must not block for more than a short bounded time and
/// must swallow their own failures.
pub trait LogSink: Sync {
    fn write_line(&self, level: Level, args: fmt::Arguments<'_>);
}

static SINK: OnceCell<&'static dyn LogSink> = OnceCell::uninit();

/// Installs the process-wide sink. Returns `false` if one is already set.
pub fn install_sink(sink: &'static dyn LogSink) -> bool {
    SINK.try_init_once(|| sink).is_ok()
}

/// Whether a sink has been installed.
pub fn has_sink() -> bool {
    SINK.is_initialized()
}

#[doc(hidden)]
pub fn _log(level: Level, args: fmt::Arguments<'_>) {
    if let Some(sink) = SINK.get() {
        sink.write_line(level, args);
    }
}
