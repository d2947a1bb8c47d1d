//! Process-wide log level, backed by the `log` facade.
//!
//! The only global state this crate keeps (besides the `log` crate's own
//! statics) is the level threshold itself, which `log` already stores as a
//! process-wide atomic written once by `log::set_max_level` and read by
//! every `log::debug!`/`log::warn!`/etc. call site. `init` just gives
//! callers a single place to set it without reaching into `log` directly,
//! and installs a bare stderr logger if (and only if) no logger has been
//! installed yet, so diagnostics are visible out of the box.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

static LOGGER_INSTALLED: AtomicBool = AtomicBool::new(false);

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(
                std::io::stderr(),
                "[{}] vafs: {}",
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: StderrLogger = StderrLogger;

/// Set the process-wide log level, installing a minimal stderr logger if
/// the caller hasn't already installed one of their own (env_logger, etc).
///
/// Safe to call more than once; later calls only adjust the level.
pub fn init(level: log::LevelFilter) {
    if !LOGGER_INSTALLED.swap(true, Ordering::SeqCst) {
        // Ignore failure: another logger already won the race, which is
        // exactly what we want to defer to.
        let _ = log::set_logger(&LOGGER);
    }
    log::set_max_level(level);
}
