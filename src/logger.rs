use std::env;
use std::io::{stderr, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::fs::{File, OpenOptions};

use anyhow::Result;
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

pub static RUNNS_LOGGER: OnceCell<RunnsLogger> = OnceCell::new();
pub static LOG_FILE: OnceCell<Option<File>> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "RUNNS_LOG_LEVEL";

/// Installs the global logger. With a file the daemon survives losing its
/// stderr to daemonization; without one everything goes to stderr, which is
/// what the client wants.
pub fn init(log_file: Option<PathBuf>) -> Result<()> {
    let _log_file = LOG_FILE.get_or_init(|| -> Option<File> {
        let level_filter = env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|level| LevelFilter::from_str(&level).ok())
            .unwrap_or(LevelFilter::Info);

        let logger = RUNNS_LOGGER.get_or_init(|| RunnsLogger::new(level_filter.to_level()));
        log::set_logger(logger)
            .map(|()| log::set_max_level(level_filter))
            .expect("set logger failed");
        log_file.as_ref().map(|log_file_path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file_path)
                .expect("failed opening log file")
        })
    });
    Ok(())
}

pub struct RunnsLogger {
    level: Option<log::Level>,
}

impl RunnsLogger {
    pub fn new(level: Option<log::Level>) -> Self {
        Self { level }
    }
}

impl Log for RunnsLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if let Some(level) = self.level {
            metadata.level() <= level
        } else {
            false
        }
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let log_msg = format!(
                "[{} {}] {}",
                record.level(),
                chrono::Local::now().to_rfc3339(),
                record.args()
            );
            if let Some(mut log_file) = LOG_FILE.get().unwrap().as_ref() {
                let _ = writeln!(log_file, "{}", log_msg);
            } else {
                let _ = writeln!(stderr(), "{}", log_msg);
            }
        }
    }

    fn flush(&self) {
        if let Some(mut log_file) = LOG_FILE.get().unwrap().as_ref() {
            let _ = log_file.flush();
        } else {
            let _ = stderr().flush();
        }
    }
}
