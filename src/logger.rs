//! Console logger for PID 1.
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{stderr, Write};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

pub const LOG_LEVEL_ENV: &str = "INITSD_LOG_LEVEL";
const PREFIX: &str = "initsd: ";

pub static INIT_LOGGER: OnceCell<InitLogger> = OnceCell::new();
pub static LOG_FILE: OnceCell<Option<File>> = OnceCell::new();

/// Installs the logger. Records always go to stderr and are mirrored to
/// `log_file` when one is given and can be opened.
pub fn init(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let level_filter = level_filter(verbose, env::var(LOG_LEVEL_ENV).ok().as_deref());

    let logger = INIT_LOGGER.get_or_init(|| InitLogger::new(level_filter.to_level()));
    log::set_logger(logger)
        .map(|()| log::set_max_level(level_filter))
        .map_err(|e| anyhow!("set logger failed: {}", e))?;

    let opened = log_file
        .as_ref()
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {:?}", path))
        })
        .transpose();

    match opened {
        Ok(file) => {
            let _ = LOG_FILE.set(file);
            Ok(())
        }
        Err(e) => {
            let _ = LOG_FILE.set(None);
            Err(e)
        }
    }
}

/// `Info` by default, `Debug` with `-v`. A valid level in the environment
/// overrides both.
pub fn level_filter(verbose: bool, env_level: Option<&str>) -> LevelFilter {
    let default = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_level
        .and_then(|level| LevelFilter::from_str(level).ok())
        .unwrap_or(default)
}

pub struct InitLogger {
    level: Option<log::Level>,
}

impl InitLogger {
    pub fn new(level: Option<log::Level>) -> Self {
        Self { level }
    }
}

fn format_record(record: &Record) -> String {
    match (record.file(), record.line()) {
        (Some(file), Some(line)) => format!(
            "[{} {}:{}] {} {}{}\r",
            record.level(),
            file,
            line,
            chrono::Local::now().to_rfc3339(),
            PREFIX,
            record.args()
        ),
        (_, _) => format!(
            "[{}] {} {}{}\r",
            record.level(),
            chrono::Local::now().to_rfc3339(),
            PREFIX,
            record.args()
        ),
    }
}

impl Log for InitLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if let Some(level) = self.level {
            metadata.level() <= level
        } else {
            false
        }
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let log_msg = format_record(record);
            let _ = writeln!(stderr(), "{}", log_msg);
            if let Some(mut log_file) = LOG_FILE.get().and_then(Option::as_ref) {
                let _ = writeln!(log_file, "{}", log_msg);
            }
        }
    }

    fn flush(&self) {
        let _ = stderr().flush();
        if let Some(mut log_file) = LOG_FILE.get().and_then(Option::as_ref) {
            let _ = log_file.flush();
        }
    }
}
