//! log backend writing timestamped lines to stderr and an optional file
//!
//! The rest of the crate logs through the `log` facade; this module is the
//! sink behind it. The console stream is always line-oriented; the file
//! sink, when configured, gets the same lines appended behind a mutex.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use derive_more::{Display, Error, From};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use parking_lot::Mutex;

#[derive(Debug, Display, From, Error)]
pub enum LoggerInitError {
    Io(std::io::Error),
    AlreadySet(SetLoggerError),
}

pub struct LoggerConfig {
    pub level: LevelFilter,
    pub console_output: bool,
    pub file_output: Option<PathBuf>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: LevelFilter::Info,
            console_output: true,
            file_output: None,
        }
    }
}

pub struct CompassLogger {
    level: LevelFilter,
    console: bool,
    file: Option<Mutex<File>>,
}

impl CompassLogger {
    /// Install the logger as the global `log` backend. Called once at
    /// startup, before any other component runs.
    pub fn init(config: LoggerConfig) -> Result<(), LoggerInitError> {
        let file = match &config.file_output {
            Some(path) => Some(Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => None,
        };

        let logger = CompassLogger {
            level: config.level,
            console: config.console_output,
            file,
        };

        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(config.level);

        Ok(())
    }
}

impl Log for CompassLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format!(
            "{} [{:5}] {} - {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );

        if self.console {
            eprintln!("{}", line);
        }

        if let Some(file) = &self.file {
            let mut file = file.lock();
            let _ = writeln!(file, "{}", line);
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            let _ = file.lock().flush();
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use std::io::Read;

    use log::Level;
    use tempfile::TempDir;

    fn make_logger(level: LevelFilter, file: Option<Mutex<File>>) -> CompassLogger {
        CompassLogger {
            level,
            console: false,
            file,
        }
    }

    #[test]
    fn test_level_filtering() {
        let logger = make_logger(LevelFilter::Info, None);

        assert!(logger.enabled(&Metadata::builder().level(Level::Warn).build()));
        assert!(logger.enabled(&Metadata::builder().level(Level::Info).build()));
        assert!(!logger.enabled(&Metadata::builder().level(Level::Debug).build()));
    }

    #[test]
    fn test_file_sink_receives_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compass.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();

        let logger = make_logger(LevelFilter::Debug, Some(Mutex::new(file)));
        logger.log(
            &Record::builder()
                .args(format_args!("query served from cache"))
                .level(Level::Debug)
                .target("compass::dns::server")
                .build(),
        );
        logger.flush();

        let mut contents = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();

        assert!(contents.contains("query served from cache"));
        assert!(contents.contains("DEBUG"));
    }
}
