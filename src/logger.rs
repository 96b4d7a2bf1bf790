//! Line-buffered logging sink for the service log file.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// A [`log::Log`] implementation that writes one line per record to the
/// configured log file, flushing after each line. Without a file it falls
/// back to stderr.
pub struct FileLogger {
    out: Mutex<Box<dyn Write + Send>>,
    level: LevelFilter,
}

impl FileLogger {
    /// Opens (or creates) `path` for appending and wraps it in a logger.
    pub fn new(path: Option<&Path>, level: LevelFilter) -> io::Result<Self> {
        let out: Box<dyn Write + Send> = match path {
            Some(path) => Box::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            ),
            None => Box::new(io::stderr()),
        };
        Ok(Self {
            out: Mutex::new(out),
            level,
        })
    }

    /// Installs this logger as the process-wide sink.
    pub fn install(self) -> Result<(), SetLoggerError> {
        log::set_max_level(self.level);
        log::set_boxed_logger(Box::new(self))
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "[{}] {}: {}", record.level(), record.target(), record.args());
            let _ = out.flush();
        }
    }

    fn flush(&self) {
        if let Ok(mut out) = self.out.lock() {
            let _ = out.flush();
        }
    }
}
