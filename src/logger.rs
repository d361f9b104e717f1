use crate::sanitize::sanitize_for_display;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);
static LOGGER: StderrLogger = StderrLogger;

/// Warnings and errors always reach stderr; everything else only with `--debug`.
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn || is_debug()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        eprintln!("[{}] {}", record.level(), sanitize_for_display(&message));
    }

    fn flush(&self) {}
}

pub fn init(debug: bool) {
    set_debug(debug);
    // A second init (tests) keeps the first logger.
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

pub fn set_debug(enabled: bool) {
    DEBUG_ENABLED.store(enabled, Ordering::SeqCst);
}

pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_gates_info() {
        let info = Metadata::builder().level(Level::Info).build();
        let warn = Metadata::builder().level(Level::Warn).build();
        set_debug(false);
        assert!(!LOGGER.enabled(&info));
        assert!(LOGGER.enabled(&warn));
        set_debug(true);
        assert!(LOGGER.enabled(&info));
        set_debug(false);
    }
}
