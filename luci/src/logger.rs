//! Process-wide logger writing to stderr or a log file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

struct LoaderLogger {
    file: Option<Mutex<File>>,
}

impl Log for LoaderLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARNING",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let line = format!(
            "[{:7}] {}: {}\n",
            tag,
            record.module_path().unwrap_or("?"),
            record.args()
        );
        match &self.file {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.write_all(line.as_bytes());
                }
            }
            None => {
                let _ = std::io::stderr().write_all(line.as_bytes());
            }
        }
    }

    fn flush(&self) {}
}

/// Installs the logger; `verbosity` 0 shows only errors, 4 and above
/// everything.
pub fn setup(verbosity: u32, logfile: Option<&str>, append: bool) -> Result<(), &'static str> {
    let file = match logfile {
        Some(path) => Some(Mutex::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(path)
                .map_err(|_| "opening log file failed")?,
        )),
        None => None,
    };
    let level = match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    log::set_boxed_logger(Box::new(LoaderLogger { file })).map_err(|_| "logger already set")?;
    log::set_max_level(level);
    Ok(())
}
