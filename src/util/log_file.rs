//! Persistent log files next to the backups.
//!
//! Errors are appended to [ERROR_LOG_FILE], everything else to [LOG_FILE].
//! Neither name follows an artifact naming convention, so retention never
//! touches them.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use log::Level;

pub const LOG_FILE: &str = "backup.log";
pub const ERROR_LOG_FILE: &str = "backup-error.log";

/// The opened log files of a folder.
#[derive(Debug)]
pub struct LogFiles {
    log: Mutex<File>,
    errors: Mutex<File>,
}

fn open_append(path: &Path) -> io::Result<Mutex<File>> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Mutex::new)
}

impl LogFiles {
    /// Opens both files in `dir` for appending, creating `dir` if needed.
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            log: open_append(&dir.join(LOG_FILE))?,
            errors: open_append(&dir.join(ERROR_LOG_FILE))?,
        })
    }

    /// Appends `line` to the file matching `level`.
    pub fn append(&self, level: Level, line: &str) {
        let file = match level {
            Level::Error => &self.errors,
            _ => &self.log,
        };
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        // the logger can't report its own failures
        if let Err(e) = writeln!(file, "{line}") {
            eprintln!("Writing to the log file failed: {e}");
        }
    }

    /// Makes `builder` copy every record into the files.
    pub fn attach(self, builder: &mut env_logger::Builder) {
        builder.format(move |buf, record| {
            let line = format!(
                "[{} {:<5} {}] {}",
                buf.timestamp(),
                record.level(),
                record.target(),
                record.args()
            );
            self.append(record.level(), &line);
            writeln!(buf, "{line}")
        });
    }
}
