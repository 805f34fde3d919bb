//! `log` backend for the kernel.
//!
//! Records go to the serial console as `[LEVEL] message`. Debug builds keep `debug!` output,
//! release builds stop at `info!`; `trace!` is compiled in but filtered unless the level is
//! raised at runtime with [`log::set_max_level`].

use log::{LevelFilter, Log, Metadata, Record};

use crate::{serial_println, sync::IrqMutex};

#[cfg(debug_assertions)]
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Debug;
#[cfg(not(debug_assertions))]
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

pub static LOGGER: Logger = Logger::new();

/// Serial console logger. One record is written per lock hold, so lines from different threads
/// never interleave.
pub struct Logger {
    lock: IrqMutex<()>,
}

impl Logger {
    pub const fn new() -> Self {
        Self {
            lock: IrqMutex::new(()),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let _guard = self.lock.lock();
        serial_println!("[{}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Installs [`LOGGER`]. Must be the first thing boot does, so every later stage can log.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(DEFAULT_LEVEL))
        .expect("Logger initialization failed");
}

/// `log::trace!`, reachable as `crate::trace!`.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => (log::trace!($($arg)*));
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => (log::debug!($($arg)*));
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => (log::info!($($arg)*));
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => (log::warn!($($arg)*));
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => (log::error!($($arg)*));
}
