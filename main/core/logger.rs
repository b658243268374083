//! The pepd logger.
//!
//! A process-global [`log::Log`] implementation writing timestamped,
//! thread-tagged records to stderr. Connection churn produces a handful of
//! lines per second at most, so records are written synchronously; the
//! buffered/asynchronous machinery a heavier logger would need is not
//! worth its failure modes here.

use std::io::Write;
use std::time::Instant;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::{Lazy, OnceCell};

static PEP_LOGGER: Lazy<PepLogger> = Lazy::new(PepLogger::new);

/// Install the logger. `max_level` is fixed for the process lifetime.
pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
    PEP_LOGGER
        .max_level
        .set(max_level)
        .expect("logger initialised twice");
    log::set_logger(&*PEP_LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

pub struct PepLogger {
    start: Instant,
    max_level: OnceCell<LevelFilter>,
}

impl PepLogger {
    fn new() -> PepLogger {
        PepLogger {
            start: Instant::now(),
            max_level: OnceCell::new(),
        }
    }

    fn max_level(&self) -> LevelFilter {
        self.max_level.get().copied().unwrap_or(LevelFilter::Trace)
    }
}

impl Log for PepLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let elapsed = self.start.elapsed();
        let secs = elapsed.as_secs();
        let thread = std::thread::current();

        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(
            out,
            "{:02}:{:02}:{:02}.{:06} [{}] [{}] [{}:{}] {}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            elapsed.subsec_micros(),
            thread.name().unwrap_or("?"),
            record.level(),
            record
                .file()
                .map(|f| f.rsplit('/').next().unwrap_or(f))
                .unwrap_or("n/a"),
            record.line().unwrap_or(0),
            record.args()
        );

        if record.level() == Level::Error {
            let _ = out.flush();
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().lock().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filtering() {
        let logger = PepLogger::new();
        logger.max_level.set(LevelFilter::Info).unwrap();

        let meta = |level: Level| Metadata::builder().level(level).build();
        assert!(logger.enabled(&meta(Level::Error)));
        assert!(logger.enabled(&meta(Level::Info)));
        assert!(!logger.enabled(&meta(Level::Debug)));
        assert!(!logger.enabled(&meta(Level::Trace)));
    }

    #[test]
    fn unset_level_allows_everything() {
        let logger = PepLogger::new();
        assert_eq!(logger.max_level(), LevelFilter::Trace);
    }
}
