use crate::debug_trace;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// A [`log::Log`] implementation that writes to the QEMU debug console.
pub struct DebugconLogger {
    max_level: LevelFilter,
}

impl DebugconLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Install this logger as the global `log` sink.
    ///
    /// Call once during early init, before any other crate logs.
    ///
    /// # Errors
    /// Returns [`SetLoggerError`] if a logger was already installed.
    pub fn init(self) -> Result<(), SetLoggerError> {
        // log::set_logger needs a &'static Log; use a static slot instead of
        // leaking a Box, since the heap may not exist yet.
        static mut LOGGER: Option<DebugconLogger> = None;

        let max_level = self.max_level;
        #[allow(static_mut_refs)]
        unsafe {
            LOGGER = Some(self);
            if let Some(logger) = LOGGER.as_ref() {
                log::set_logger(logger as &'static dyn Log)?;
            }
        }
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for DebugconLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        debug_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        // no-op for the debug port
    }
}
