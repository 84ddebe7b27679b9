//! Routes log records around the progress bars so the two never interleave.

use indicatif::MultiProgress;
use log::{Log, Metadata, Record, SetLoggerError};

/// Writes each record with the bars of `progress` cleared, then redraws them.
pub struct ProgressLogger<L> {
    inner: L,
    progress: MultiProgress,
}

impl<L: Log> ProgressLogger<L> {
    pub fn new(inner: L, progress: MultiProgress) -> Self {
        Self { inner, progress }
    }
}

impl<L: Log> Log for ProgressLogger<L> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.inner.enabled(record.metadata()) {
            self.progress.suspend(|| self.inner.log(record));
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Installs `env_logger` (configured from `RUST_LOG`) behind `progress`.
pub fn init(progress: MultiProgress) -> Result<(), SetLoggerError> {
    let logger = env_logger::Builder::from_default_env().build();
    let level = logger.filter();
    log::set_boxed_logger(Box::new(ProgressLogger::new(logger, progress)))?;
    log::set_max_level(level);
    Ok(())
}
