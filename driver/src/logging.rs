//! Console output for the host driver.
//!
//! Log lines are tagged with the thread that wrote them, which for vCPU
//! workers names the VM and vCPU being run.

use std::fmt;
use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

static CONSOLE: Mutex<()> = Mutex::new(());

/// Parses a `LOG` value. Unknown or missing levels disable logging.
fn parse_level(level: Option<&str>) -> LevelFilter {
    let level = match level {
        Some(level) => level.trim(),
        None => return LevelFilter::Off,
    };
    [
        LevelFilter::Error,
        LevelFilter::Warn,
        LevelFilter::Info,
        LevelFilter::Debug,
        LevelFilter::Trace,
    ]
    .into_iter()
    .find(|f| f.as_str().eq_ignore_ascii_case(level))
    .unwrap_or(LevelFilter::Off)
}

/// Installs the console logger, with the level taken from `LOG`. Does
/// nothing if a logger is already installed.
pub fn init() {
    static LOGGER: ConsoleLogger = ConsoleLogger;
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(parse_level(std::env::var("LOG").ok().as_deref()));
    }
}

pub fn print(args: fmt::Arguments) {
    let _locked = CONSOLE.lock();
    let mut out = std::io::stdout().lock();
    // Nowhere left to report a failing console.
    let _ = out.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::logging::print(format_args!($fmt $(, $($arg)+)?));
    }
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::logging::print(format_args!(concat!($fmt, "\n") $(, $($arg)+)?));
    }
}

macro_rules! with_color {
    ($color:expr, $($arg:tt)*) => {
        format_args!("\u{1B}[{}m{}\u{1B}[m", $color as u8, format_args!($($arg)*))
    };
}

#[repr(u8)]
#[derive(Clone, Copy)]
enum Color {
    Red = 31,
    Green = 32,
    Yellow = 33,
    Magenta = 35,
    Cyan = 36,
    Gray = 90,
}

/// Level tag and message colors.
fn colors(level: Level) -> (Color, Color) {
    match level {
        Level::Error => (Color::Red, Color::Red),
        Level::Warn => (Color::Yellow, Color::Yellow),
        Level::Info => (Color::Green, Color::Green),
        Level::Debug => (Color::Cyan, Color::Gray),
        Level::Trace => (Color::Gray, Color::Gray),
    }
}

/// Messages from the core itself stand out from the driver's own.
fn source_color(target: &str) -> Color {
    if target.starts_with("peregrine") {
        Color::Magenta
    } else {
        Color::Gray
    }
}

struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let (tag, body) = colors(record.level());
        let now = crate::timer::current_time();
        let thread = std::thread::current();
        print(format_args!(
            "[{:>4}.{:06} {} {} {}] {}\n",
            now.as_secs(),
            now.subsec_micros(),
            with_color!(tag, "{:<5}", record.level()),
            thread.name().unwrap_or("host"),
            with_color!(
                source_color(record.target()),
                "{}:{}",
                record.target(),
                record.line().unwrap_or(0)
            ),
            with_color!(body, "{}", record.args()),
        ));
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(parse_level(Some("trace")), LevelFilter::Trace);
        assert_eq!(parse_level(Some("WARN")), LevelFilter::Warn);
        assert_eq!(parse_level(Some(" info\n")), LevelFilter::Info);
        assert_eq!(parse_level(Some("loud")), LevelFilter::Off);
        assert_eq!(parse_level(None), LevelFilter::Off);
    }

    #[test]
    fn core_messages_are_highlighted() {
        assert_eq!(source_color("peregrine::vm") as u8, Color::Magenta as u8);
        assert_eq!(source_color("pg_driver::socket") as u8, Color::Gray as u8);
    }
}
