//! Journal logging
//!
//! Each [`AsyncLogger`] owns one append-only file and a dedicated writer
//! thread fed by a bounded queue. Producers block when the queue is full,
//! so lines are never dropped.

use super::event::EventKind;
use chrono::Local;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, warn};

/// Pending lines a channel holds before producers block
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

const SESSION_START: &str = "------ session start ------";
const SESSION_END: &str = "------ session end ------";

/// Logger errors, reported only when a channel is opened
#[derive(Error, Debug)]
pub enum LogError {
    /// Parent directory could not be created
    #[error("Failed to create log directory {path}: {source}")]
    CreateDir {
        /// Directory path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// File could not be opened for append
    #[error("Failed to open log file {path}: {source}")]
    Open {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Writer thread could not be started
    #[error("Failed to start log writer: {0}")]
    Spawn(#[source] io::Error),
}

/// Severity tag of a journal record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    /// Received data
    Recv,
    /// Sent data
    Sent,
    /// Error
    Erro,
    /// Informational
    Info,
}

impl LogTag {
    /// Four letter tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recv => "RECV",
            Self::Sent => "SENT",
            Self::Erro => "ERRO",
            Self::Info => "INFO",
        }
    }
}

impl fmt::Display for LogTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EventKind> for LogTag {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Data => Self::Recv,
            EventKind::Error => Self::Erro,
            EventKind::Info => Self::Info,
        }
    }
}

/// Format one record as `[TAG ] [HH:MM:SS.mmm] text`
pub fn format_record(tag: LogTag, text: &str) -> String {
    format!(
        "[{:<4}] [{}] {}",
        tag.as_str(),
        Local::now().format("%H:%M:%S%.3f"),
        text
    )
}

/// Today's file for `channel`: `<dir>/<channel>/LOG-YYMMDD.txt`
pub fn daily_log_path(dir: &Path, channel: &str) -> PathBuf {
    dir.join(channel)
        .join(format!("LOG-{}.txt", Local::now().format("%y%m%d")))
}

/// One log channel backed by a writer thread
pub struct AsyncLogger {
    path: PathBuf,
    sender: Mutex<Option<Sender<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncLogger {
    /// Open `path` for append with the default queue capacity
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        Self::with_capacity(path, DEFAULT_QUEUE_CAPACITY)
    }

    /// Open `path` for append, holding at most `capacity` pending lines
    pub fn with_capacity(path: impl Into<PathBuf>, capacity: usize) -> Result<Self, LogError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LogError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LogError::Open {
                path: path.clone(),
                source,
            })?;

        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        let writer = thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || write_loop(file, receiver))
            .map_err(LogError::Spawn)?;

        debug!("Journal opened: {}", path.display());
        Ok(Self {
            path,
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// File this channel appends to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the channel still accepts lines
    pub fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Enqueue `line`, blocking while the queue is full. No-op once closed.
    pub fn log(&self, line: impl Into<String>) {
        let sender = self.sender.lock().clone();
        if let Some(sender) = sender {
            // Fails only if the writer thread died
            let _ = sender.send(line.into());
        }
    }

    /// Enqueue a formatted record
    pub fn record(&self, tag: LogTag, text: &str) {
        self.log(format_record(tag, text));
    }

    /// Stop accepting lines and wait until everything queued is on disk.
    /// Concurrent callers all wait for the same drain.
    pub fn close(&self) {
        // Held across the join so a second caller returns only once drained
        let mut writer = self.writer.lock();
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        drop(sender);

        if let Some(writer) = writer.take() {
            if writer.join().is_err() {
                warn!("Log writer for {} panicked", self.path.display());
            }
        }
        debug!("Journal closed: {}", self.path.display());
    }
}

impl fmt::Debug for AsyncLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLogger")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for AsyncLogger {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_loop(file: File, receiver: Receiver<String>) {
    let mut out = BufWriter::new(file);
    let _ = writeln!(out, "{SESSION_START}");

    for line in receiver.iter() {
        if let Err(e) = writeln!(out, "{line}") {
            debug!("Journal write failed: {}", e);
        }
        if receiver.is_empty() {
            let _ = out.flush();
        }
    }

    let _ = writeln!(out, "{SESSION_END}");
    let _ = out.flush();
}

/// Named log channels
pub struct LogBook {
    channels: RwLock<HashMap<String, Arc<AsyncLogger>>>,
    capacity: usize,
}

impl LogBook {
    /// Empty book whose channels hold `capacity` pending lines
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Open channel `name` on `path`, replacing any channel of that name
    pub fn open(&self, name: &str, path: impl Into<PathBuf>) -> Result<PathBuf, LogError> {
        let logger = Arc::new(AsyncLogger::with_capacity(path, self.capacity)?);
        let path = logger.path().to_path_buf();
        let previous = self.channels.write().insert(name.to_string(), logger);
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(path)
    }

    /// Whether channel `name` is open
    pub fn is_open(&self, name: &str) -> bool {
        self.channels.read().contains_key(name)
    }

    /// Append a record to `name`; silently ignored if it is not open
    pub fn log(&self, name: &str, tag: LogTag, text: &str) {
        let logger = self.channels.read().get(name).cloned();
        if let Some(logger) = logger {
            logger.record(tag, text);
        }
    }

    /// Close channel `name`
    pub fn close(&self, name: &str) {
        let logger = self.channels.write().remove(name);
        if let Some(logger) = logger {
            logger.close();
        }
    }

    /// Close every channel
    pub fn close_all(&self) {
        let loggers: Vec<_> = self.channels.write().drain().map(|(_, l)| l).collect();
        for logger in loggers {
            logger.close();
        }
    }
}

impl Default for LogBook {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_close_twice_drains_queue() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("LOG.txt");
        let logger = AsyncLogger::open(&path).unwrap();

        logger.log("one");
        logger.log("two");
        logger.log("three");
        logger.close();
        logger.close();

        assert_eq!(
            lines(&path),
            vec![SESSION_START, "one", "two", "three", SESSION_END]
        );
    }

    #[test]
    fn test_log_after_close_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("LOG.txt");
        let logger = AsyncLogger::open(&path).unwrap();

        logger.close();
        logger.log("late");
        assert!(!logger.is_open());
        assert!(!lines(&path).contains(&"late".to_string()));
    }

    #[test]
    fn test_full_queue_blocks_instead_of_dropping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("LOG.txt");
        let logger = Arc::new(AsyncLogger::with_capacity(&path, 1).unwrap());

        let producer = {
            let logger = Arc::clone(&logger);
            thread::spawn(move || {
                for i in 0..500 {
                    logger.log(format!("line {i}"));
                }
            })
        };
        producer.join().unwrap();
        logger.close();

        let written = lines(&path);
        assert_eq!(written.len(), 502);
        assert_eq!(written[1], "line 0");
        assert_eq!(written[500], "line 499");
    }

    #[test]
    fn test_concurrent_close_waits_for_drain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("LOG.txt");
        let logger = Arc::new(AsyncLogger::with_capacity(&path, 4).unwrap());
        for i in 0..200 {
            logger.log(format!("line {i}"));
        }

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let logger = Arc::clone(&logger);
                let path = path.clone();
                thread::spawn(move || {
                    logger.close();
                    lines(&path)
                })
            })
            .collect();

        for closer in closers {
            let written = closer.join().unwrap();
            assert_eq!(written.len(), 202);
            assert_eq!(written.last().map(String::as_str), Some(SESSION_END));
        }
    }

    #[test]
    fn test_reopen_appends_new_session() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("LOG.txt");

        AsyncLogger::open(&path).unwrap().log("first");
        AsyncLogger::open(&path).unwrap().log("second");

        let written = lines(&path);
        assert_eq!(written.iter().filter(|l| *l == SESSION_START).count(), 2);
        assert_eq!(written.last().map(String::as_str), Some(SESSION_END));
    }

    #[test]
    fn test_open_failure_is_reported() {
        let dir = tempdir().unwrap();
        let result = AsyncLogger::open(dir.path());
        assert!(matches!(result, Err(LogError::Open { .. })));
    }

    #[test]
    fn test_format_record() {
        let record = format_record(LogTag::Sent, "STATUS");
        assert!(record.starts_with("[SENT] ["));
        assert!(record.ends_with("] STATUS"));
        // "[SENT] [" + "HH:MM:SS.mmm" + "] "
        assert_eq!(record.len(), 8 + 12 + 2 + "STATUS".len());
    }

    #[test]
    fn test_daily_log_path() {
        let path = daily_log_path(Path::new("/var/log"), "Commander");
        assert_eq!(path.parent(), Some(Path::new("/var/log/Commander")));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("LOG-") && name.ends_with(".txt"));
        assert_eq!(name.len(), "LOG-YYMMDD.txt".len());
    }

    #[test]
    fn test_log_book_channels() {
        let dir = tempdir().unwrap();
        let book = LogBook::default();
        book.log("missing", LogTag::Info, "ignored");

        let path = book.open("Commander", dir.path().join("LOG.txt")).unwrap();
        assert!(book.is_open("Commander"));
        book.log("Commander", LogTag::Recv, "hello");
        book.close_all();
        assert!(!book.is_open("Commander"));

        let written = lines(&path);
        assert_eq!(written.len(), 3);
        assert!(written[1].starts_with("[RECV] ") && written[1].ends_with(" hello"));
    }

    #[test]
    fn test_event_kind_tags() {
        assert_eq!(LogTag::from(EventKind::Data), LogTag::Recv);
        assert_eq!(LogTag::from(EventKind::Error), LogTag::Erro);
        assert_eq!(LogTag::from(EventKind::Info), LogTag::Info);
    }
}
