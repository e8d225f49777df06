//! Persistent session log
//!
//! Every session log line the shell prints is also appended to a text
//! file, `log.txt` in the local data directory unless `--log-file` says
//! otherwise. `lkt logs` prints it and `lkt logs --clear` empties it.

use directories::ProjectDirs;
use lkt_tunnel::LogEntry;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const LOG_FILE: &str = "log.txt";

pub struct LogFile {
    path: PathBuf,
}

impl LogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `log.txt` under the platform's local data directory
    pub fn default_location() -> Option<Self> {
        ProjectDirs::from("", "", "lktunnel").map(|dirs| Self::new(dirs.data_local_dir().join(LOG_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open for appending, creating the file and its directory
    pub fn writer(&self) -> io::Result<LogWriter> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(LogWriter { file })
    }

    /// Whole log; a missing file reads as empty
    pub fn read(&self) -> io::Result<String> {
        match fs::read_to_string(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            result => result,
        }
    }

    pub fn clear(&self) -> io::Result<()> {
        match File::options().write(true).truncate(true).open(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result.map(drop),
        }
    }
}

pub struct LogWriter {
    file: File,
}

impl LogWriter {
    pub fn append(&mut self, entry: &LogEntry) -> io::Result<()> {
        writeln!(self.file, "{}", entry)
    }
}
