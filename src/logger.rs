/*
 * Kernel Logging
 *
 * Hooks the `log` crate facade up to the serial console so kernel code can
 * use log::info!/debug!/warn!/error! from the first moments of boot.
 */

use log::{Level, LevelFilter, Metadata, Record};

use crate::cprintln;

struct MicaLogger;

impl log::Log for MicaLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            cprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: MicaLogger = MicaLogger;

/// Install the logger. The console must already be initialized.
pub fn init() {
    match log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info)) {
        Ok(()) => cprintln!("Logger initialized"),
        Err(err) => panic!("Error initializing logger: {}", err),
    }
}
