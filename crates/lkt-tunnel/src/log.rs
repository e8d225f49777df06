//! Session Log Stream
//!
//! Every component reports user-visible progress through a [`LogSink`].
//! Entries travel over a bounded channel that the caller drains through
//! [`LogStream`], and each one is mirrored to `tracing`.

use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default channel capacity
pub const LOG_CAPACITY: usize = 1024;

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A single log line
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// When the entry was produced
    pub timestamp: DateTime<Local>,
    /// Severity
    pub level: LogLevel,
    /// Producing backend, if any
    pub source: Option<&'static str>,
    /// Message text
    pub text: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.timestamp.format("%Y-%m-%d %H:%M:%S"))?;
        if let Some(source) = self.source {
            write!(f, "[{}] ", source)?;
        }
        f.write_str(&self.text)
    }
}

/// Producer side of the log channel
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::Sender<LogEntry>,
    source: Option<&'static str>,
}

/// Consumer side of the log channel
pub struct LogStream {
    rx: mpsc::Receiver<LogEntry>,
}

/// Create a connected sink/stream pair
pub fn channel(capacity: usize) -> (LogSink, LogStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (LogSink { tx, source: None }, LogStream { rx })
}

impl LogSink {
    /// Same channel, tagged with a backend name
    pub fn scoped(&self, source: &'static str) -> Self {
        Self {
            tx: self.tx.clone(),
            source: Some(source),
        }
    }

    pub fn info(&self, text: impl Into<String>) {
        self.push(LogLevel::Info, text.into());
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.push(LogLevel::Warn, text.into());
    }

    pub fn error(&self, text: impl Into<String>) {
        self.push(LogLevel::Error, text.into());
    }

    /// Deliver a line, waiting for channel space
    ///
    /// Used by output pumps so a chatty process gets backpressure instead
    /// of losing lines.
    pub async fn send(&self, level: LogLevel, text: String) {
        let entry = self.entry(level, text);
        mirror(&entry);
        if self.tx.send(entry).await.is_err() {
            debug!("log stream closed");
        }
    }

    fn push(&self, level: LogLevel, text: String) {
        let entry = self.entry(level, text);
        mirror(&entry);
        if let Err(e) = self.tx.try_send(entry) {
            debug!("log entry not queued: {}", e);
        }
    }

    fn entry(&self, level: LogLevel, text: String) -> LogEntry {
        LogEntry {
            timestamp: Local::now(),
            level,
            source: self.source,
            text,
        }
    }
}

fn mirror(entry: &LogEntry) {
    let source = entry.source.unwrap_or("core");
    match entry.level {
        LogLevel::Info => info!(source = source, "{}", entry.text),
        LogLevel::Warn => warn!(source = source, "{}", entry.text),
        LogLevel::Error => error!(source = source, "{}", entry.text),
    }
}

impl LogStream {
    /// Wait for the next entry
    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }

    /// Take everything already queued
    pub fn drain(&mut self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            entries.push(entry);
        }
        entries
    }
}
