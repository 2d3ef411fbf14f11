//! Logging setup and the in-memory log history.
//!
//! Every record goes through the `log` facade.  [`init_logging`] installs a
//! logger that formats to stderr with `env_logger` and also appends each
//! accepted record to a bounded [`LogHistory`], which the binary can dump to
//! a file on exit.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::config::LogConfig;

/// One captured log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub message: String,
}

impl LogEntry {
    /// `[YYYY-mm-dd HH:MM:SS] [LEVEL] message`
    pub fn format_line(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.message
        )
    }
}

// ---------------------------------------------------------------------------
// LogHistory
// ---------------------------------------------------------------------------

/// Ring of the most recent log entries.  Safe to share across threads.
#[derive(Debug)]
pub struct LogHistory {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl LogHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(&self, level: Level, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        };
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Up to `count` entries, newest first.
    pub fn recent(&self, count: usize) -> Vec<LogEntry> {
        self.lock().iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Write every entry, oldest first, to `path`.  Returns the number of
    /// lines written.
    pub fn dump_to(&self, path: &Path) -> io::Result<usize> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        // snapshot so the lock is not held across file I/O
        let snapshot: Vec<LogEntry> = self.lock().iter().cloned().collect();

        let mut out = BufWriter::new(fs::File::create(path)?);
        for entry in &snapshot {
            writeln!(out, "{}", entry.format_line())?;
        }
        out.flush()?;
        Ok(snapshot.len())
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

struct HistoryLogger {
    inner: env_logger::Logger,
    history: Arc<LogHistory>,
}

impl Log for HistoryLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.inner.matches(record) {
            return;
        }
        self.inner.log(record);
        self.history.push(record.level(), record.args().to_string());
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Filter used when `RUST_LOG` is unset.
fn default_filter(config: &LogConfig) -> &'static str {
    if config.enabled {
        "info"
    } else {
        "error"
    }
}

/// Install the global logger and return its history.
///
/// With logging disabled only errors are kept, whatever `RUST_LOG` says.
/// Fails if a logger was already installed.
pub fn init_logging(config: &LogConfig) -> Result<Arc<LogHistory>, SetLoggerError> {
    let inner = if config.enabled {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(default_filter(config)),
        )
        .build()
    } else {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Error)
            .build()
    };
    let max_level = inner.filter();

    let history = Arc::new(LogHistory::new(config.history_entries));
    log::set_boxed_logger(Box::new(HistoryLogger {
        inner,
        history: Arc::clone(&history),
    }))?;
    log::set_max_level(max_level);
    Ok(history)
}
