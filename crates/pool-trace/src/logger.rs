use std::{
    fmt,
    io::{self, Write as _},
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{Level, LevelFilter, Log, Metadata, Record};

static LOGGER: TraceLogger = TraceLogger {
    sequence: AtomicUsize::new(0),
};

/// Writes log records to stderr, numbered in emission order.
struct TraceLogger {
    sequence: AtomicUsize,
}

impl Log for TraceLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "{seq:6} {} {}",
            LevelFormat(record.level()),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

/// Installs the logger. Later calls only change the level.
pub(crate) fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_err() {
        log::debug!("logger already installed");
    }
    log::set_max_level(level);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Color {
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    DarkGray,
}

impl Color {
    fn code(self) -> u8 {
        match self {
            Self::Red => 31,
            Self::Green => 32,
            Self::Yellow => 33,
            Self::Blue => 34,
            Self::Magenta => 35,
            Self::DarkGray => 90,
        }
    }
}

/// Bold, colored text for terminals.
pub(crate) struct Colored<T>(pub(crate) Color, pub(crate) T);

impl<T> fmt::Display for Colored<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.0.code();
        let value = &self.1;
        write!(f, "\x1B[{code};1m{value}\x1B[0m")
    }
}

struct LevelFormat(Level);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (color, msg) = match self.0 {
            Level::Trace => (Color::Magenta, "TRACE"),
            Level::Debug => (Color::Blue, "DEBUG"),
            Level::Info => (Color::Green, " INFO"),
            Level::Warn => (Color::Yellow, " WARN"),
            Level::Error => (Color::Red, "ERROR"),
        };
        write!(f, "{}", Colored(color, msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_tags_are_colored_and_aligned() {
        assert_eq!(LevelFormat(Level::Info).to_string(), "\x1B[32;1m INFO\x1B[0m");
        assert_eq!(LevelFormat(Level::Error).to_string(), "\x1B[31;1mERROR\x1B[0m");
        assert_eq!(Colored(Color::DarkGray, 7).to_string(), "\x1B[90;1m7\x1B[0m");
    }
}
