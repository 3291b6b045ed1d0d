//! Logging infrastructure for CrabMMC
//!
//! This module provides a `log` crate backend that writes timestamped,
//! level-tagged lines to a kernel-supplied [`LogSink`] (serial port, debug
//! console, ...). Every driver in the crate logs through the `log` facade,
//! so installing this backend is optional: a kernel with its own `log`
//! implementation gets the same messages.
//!
//! Per-command tracing is disabled by default as it is very slow.
//! Enable with the `sdhci-trace` feature flag.

use core::fmt::{self, Write};
use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};
use spin::Once;

/// Output target for log lines
pub trait LogSink: Send + Sync {
    /// Write a chunk of text
    fn write_str(&self, s: &str);

    /// Microseconds since boot, used for the line prefix
    fn timestamp_us(&self) -> u64 {
        0
    }

    /// Whether the sink understands ANSI color escapes
    fn supports_color(&self) -> bool {
        false
    }
}

struct SinkWriter<'a>(&'a dyn LogSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

fn level_str(level: Level, color: bool) -> &'static str {
    if color {
        match level {
            Level::Error => "\x1b[31mERROR\x1b[0m",
            Level::Warn => "\x1b[33mWARN\x1b[0m ",
            Level::Info => "\x1b[32mINFO\x1b[0m ",
            Level::Debug => "\x1b[34mDEBUG\x1b[0m",
            Level::Trace => "\x1b[35mTRACE\x1b[0m",
        }
    } else {
        match level {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }
}

/// Format one log line: `[  timestamp] [LEVEL] message`
fn write_line(
    out: &mut dyn Write,
    timestamp_us: u64,
    level: Level,
    color: bool,
    args: &fmt::Arguments<'_>,
) -> fmt::Result {
    writeln!(
        out,
        "[{:>10}] [{}] {}",
        timestamp_us,
        level_str(level, color),
        args
    )
}

/// Sink-backed logger
struct SinkLogger;

static SINK: Once<&'static dyn LogSink> = Once::new();

impl log::Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = SINK.get() {
            let mut writer = SinkWriter(*sink);
            let _ = write_line(
                &mut writer,
                sink.timestamp_us(),
                record.level(),
                sink.supports_color(),
                record.args(),
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: SinkLogger = SinkLogger;

/// Initialize the logging subsystem
///
/// Fails if another `log` backend was installed first; the sink is kept
/// either way so a later [`init`] is a no-op.
pub fn init(sink: &'static dyn LogSink) -> Result<(), SetLoggerError> {
    SINK.call_once(|| sink);
    log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Debug))
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::sync::Mutex;

    struct CaptureSink {
        lines: Mutex<String>,
    }

    impl LogSink for CaptureSink {
        fn write_str(&self, s: &str) {
            self.lines.lock().unwrap().push_str(s);
        }

        fn timestamp_us(&self) -> u64 {
            42
        }
    }

    #[test]
    fn test_line_format_plain() {
        let mut out = String::new();
        write_line(
            &mut out,
            1234,
            Level::Warn,
            false,
            &format_args!("SDHCI: {}", "no card"),
        )
        .unwrap();
        assert_eq!(out, "[      1234] [WARN ] SDHCI: no card\n");
    }

    #[test]
    fn test_line_format_color() {
        let mut out = String::new();
        write_line(&mut out, 0, Level::Error, true, &format_args!("x")).unwrap();
        assert!(out.contains("\x1b[31mERROR\x1b[0m"));
    }

    #[test]
    fn test_init_routes_records_to_sink() {
        static SINK: std::sync::OnceLock<CaptureSink> = std::sync::OnceLock::new();
        let sink = SINK.get_or_init(|| CaptureSink {
            lines: Mutex::new(String::new()),
        });

        // Only one logger per process; ignore failure if another test won
        let _ = init(sink);
        log::info!("MMC: logger smoke test");

        if core::ptr::eq(*super::SINK.get().unwrap(), sink as &dyn LogSink) {
            let lines = sink.lines.lock().unwrap();
            assert!(lines.contains("[        42] [INFO ] MMC: logger smoke test"));
        }
    }
}
