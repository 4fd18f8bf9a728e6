//! This module contains the global logger instance used by the `log` crate.
//!
//! Diagnostics go to stderr so that stdout carries only the report the
//! loader is contracted to emit.

use std::io::Write;

/// The backed logger instance used for the `log` crate.
static LOGGER: StderrLogger = StderrLogger;

/// Minimal `log` sink writing `[LEVEL] message` lines to stderr.
pub struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "[{:5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Install the stderr logger.
///
/// The level defaults to `Info` (`Trace` in debug builds) and can be
/// overridden through the `FAULTLOAD_LOG` environment variable
/// (`off`, `error`, `warn`, `info`, `debug`, `trace`).
pub fn init() {
    log::set_logger(&LOGGER).expect("Failed to set logger");

    let from_env = std::env::var("FAULTLOAD_LOG")
        .ok()
        .and_then(|value| value.parse::<log::LevelFilter>().ok());
    log::set_max_level(from_env.unwrap_or(if cfg!(debug_assertions) {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    }));
}
