use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::RwLock;

#[cfg(feature = "debug_verbose")]
const DEFAULT_LEVEL: LogLevel = LogLevel::DEBUG;
#[cfg(not(feature = "debug_verbose"))]
const DEFAULT_LEVEL: LogLevel = LogLevel::INFO;

static LOG_LEVEL: AtomicU8 = AtomicU8::new(DEFAULT_LEVEL.priority());
static SINK: RwLock<Option<&'static dyn LogSink>> = RwLock::new(None);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    PANIC,
    FATAL,
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::PANIC => "PANIC",
            LogLevel::FATAL => "FATAL",
            LogLevel::ERROR => "ERROR",
            LogLevel::WARN => "WARN",
            LogLevel::INFO => "INFO",
            LogLevel::DEBUG => "DEBUG",
            LogLevel::TRACE => "TRACE",
        }
    }

    fn serial_color(self) -> &'static str {
        match self {
            LogLevel::PANIC => "\x1b[1;37;41m",
            LogLevel::FATAL => "\x1b[1;37;41m",
            LogLevel::ERROR => "\x1b[1;31m",
            LogLevel::WARN => "\x1b[33m",
            LogLevel::INFO => "\x1b[32m",
            LogLevel::DEBUG => "\x1b[36m",
            LogLevel::TRACE => "\x1b[90m",
        }
    }

    const fn priority(self) -> u8 {
        match self {
            LogLevel::PANIC => 0,
            LogLevel::FATAL => 1,
            LogLevel::ERROR => 2,
            LogLevel::WARN => 3,
            LogLevel::INFO => 4,
            LogLevel::DEBUG => 5,
            LogLevel::TRACE => 6,
        }
    }

    fn from_priority(value: u8) -> Self {
        match value {
            0 => LogLevel::PANIC,
            1 => LogLevel::FATAL,
            2 => LogLevel::ERROR,
            3 => LogLevel::WARN,
            4 => LogLevel::INFO,
            5 => LogLevel::DEBUG,
            _ => LogLevel::TRACE,
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("panic") {
            Some(LogLevel::PANIC)
        } else if value.eq_ignore_ascii_case("fatal") {
            Some(LogLevel::FATAL)
        } else if value.eq_ignore_ascii_case("error") {
            Some(LogLevel::ERROR)
        } else if value.eq_ignore_ascii_case("warn") || value.eq_ignore_ascii_case("warning") {
            Some(LogLevel::WARN)
        } else if value.eq_ignore_ascii_case("info") {
            Some(LogLevel::INFO)
        } else if value.eq_ignore_ascii_case("debug") {
            Some(LogLevel::DEBUG)
        } else if value.eq_ignore_ascii_case("trace") {
            Some(LogLevel::TRACE)
        } else {
            None
        }
    }
}

/// Destination for formatted log lines (serial port, framebuffer console,
/// or a capture buffer in tests).
pub trait LogSink: Send + Sync {
    fn write_line(&self, level: LogLevel, args: fmt::Arguments<'_>);
}

/// Route all further log output to `sink`, replacing any previous sink.
pub fn install(sink: &'static dyn LogSink) {
    *SINK.write() = Some(sink);
}

/// Detach the current sink; log calls become no-ops until the next install.
pub fn uninstall() {
    *SINK.write() = None;
}

pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level.priority() > LOG_LEVEL.load(Ordering::Relaxed) {
        return;
    }

    // A sink being swapped out must not deadlock an interrupt handler.
    let Some(guard) = SINK.try_read() else {
        return;
    };
    if let Some(sink) = *guard {
        sink.write_line(level, args);
    }
}

pub fn set_max_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    LogLevel::from_priority(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn enabled(level: LogLevel) -> bool {
    level.priority() <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn parse_level_directive(cmdline: &str) -> Option<LogLevel> {
    for token in cmdline.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            if key.eq_ignore_ascii_case("log") || key.eq_ignore_ascii_case("loglevel") {
                if let Some(level) = LogLevel::from_str(value) {
                    return Some(level);
                }
            }
        }
    }
    None
}

/// Write one log line in the kernel's serial format.
///
/// `colored` wraps the line in the ANSI colour of its level, the way the
/// serial console shows it.
pub fn format_line<W: Write>(
    out: &mut W,
    level: LogLevel,
    args: fmt::Arguments<'_>,
    colored: bool,
) -> fmt::Result {
    if colored {
        write!(
            out,
            "{color}[{level:<5}] {message}\x1b[0m\n",
            color = level.serial_color(),
            level = LevelDisplay(level),
            message = args,
        )
    } else {
        write!(out, "[{level:<5}] {message}\n", level = LevelDisplay(level), message = args)
    }
}

struct LevelDisplay(LogLevel);

impl fmt::Display for LevelDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.0.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_directive() {
        assert_eq!(parse_level_directive("quiet log=debug"), Some(LogLevel::DEBUG));
        assert_eq!(parse_level_directive("loglevel=WARNING"), Some(LogLevel::WARN));
        assert_eq!(parse_level_directive("log=bogus root=/dev/vda1"), None);
        assert_eq!(parse_level_directive(""), None);
    }

    #[test]
    fn test_format_line_plain() {
        let mut out = alloc::string::String::new();
        format_line(&mut out, LogLevel::WARN, format_args!("cpu {} idle", 3), false).unwrap();
        assert_eq!(out, "[WARN ] cpu 3 idle\n");
    }

    #[test]
    fn test_priority_roundtrip() {
        for level in [
            LogLevel::PANIC,
            LogLevel::FATAL,
            LogLevel::ERROR,
            LogLevel::WARN,
            LogLevel::INFO,
            LogLevel::DEBUG,
            LogLevel::TRACE,
        ] {
            assert_eq!(LogLevel::from_priority(level.priority()), level);
        }
    }
}
