//! Console-backed implementation of the `log` facade.

use core::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record};

use crate::console;

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut writer = console::Writer;
        let _ = writeln!(writer, "[{:>5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Install the console logger; called by the boot hart before any output.
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Info);
}
