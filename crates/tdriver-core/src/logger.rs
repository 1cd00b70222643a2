//! Traffic loggers.
//!
//! The [`TrafficLogger`] trait receives every payload sent to and received
//! from an implementation under test, in real time and in the order the
//! receive buffer sees it. It also receives short lifecycle notes ("start
//! receiver", "failed to connect") so that a traffic log reads as a complete
//! transcript of a test run.
//!
//! Four implementations are provided:
//!
//! - [`NullLogger`]: discards everything
//! - [`ConsoleLogger`]: prints each entry to stdout
//! - [`FileLogger`]: prints to stdout and appends timestamped lines to a file
//! - [`TracingLogger`]: forwards entries as `tracing` events
//!
//! Entries are tagged `TX:<target>`, `RX:<target>`, `--:<target>` (info note)
//! or `ER:<target>` (error note).

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Direction of a logged payload, seen from the test driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent to the implementation under test.
    Outbound,
    /// Received from the implementation under test.
    Inbound,
}

impl Direction {
    /// Two-letter log tag: `TX` or `RX`.
    pub fn tag(self) -> &'static str {
        match self {
            Direction::Outbound => "TX",
            Direction::Inbound => "RX",
        }
    }
}

/// Severity of a lifecycle note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoteLevel {
    /// Normal lifecycle event.
    Info,
    /// Connector failure or other problem.
    Error,
}

impl NoteLevel {
    /// Two-letter log tag: `--` or `ER`.
    pub fn tag(self) -> &'static str {
        match self {
            NoteLevel::Info => "--",
            NoteLevel::Error => "ER",
        }
    }
}

/// Sink for traffic and lifecycle notes of one or more targets.
///
/// `target` is the name of the target the entry belongs to (may be empty),
/// which lets one logger serve several targets.
pub trait TrafficLogger: Send + Sync {
    /// Record one payload, called once per send and once per received chunk.
    fn record(&self, target: &str, direction: Direction, payload: &[u8]);

    /// Record a lifecycle note. The default implementation drops it.
    fn note(&self, target: &str, level: NoteLevel, message: &str) {
        let _ = (target, level, message);
    }
}

/// A logger that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl TrafficLogger for NullLogger {
    fn record(&self, _target: &str, _direction: Direction, _payload: &[u8]) {}
}

/// Render a payload as one log line body ending in a line terminator.
///
/// Payloads are decoded lossily as UTF-8. An empty payload becomes a bare
/// newline; a payload not already ending in `\r` or `\n` gets a `\n`.
pub fn line_body(payload: &[u8]) -> Cow<'_, str> {
    let text = String::from_utf8_lossy(payload);
    if text.ends_with(['\r', '\n']) {
        text
    } else {
        Cow::Owned(format!("{text}\n"))
    }
}

fn entry_tag(tag: &str, target: &str) -> String {
    format!("{tag}:{target}")
}

/// Prints every entry to stdout, newline-terminated.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleLogger;

impl TrafficLogger for ConsoleLogger {
    fn record(&self, _target: &str, _direction: Direction, payload: &[u8]) {
        print!("{}", line_body(payload));
    }

    fn note(&self, _target: &str, _level: NoteLevel, message: &str) {
        print!("{}", line_body(message.as_bytes()));
    }
}

/// Prints every entry to stdout and appends it to a log file.
///
/// Each line has the form `<unix-time-ns>:<tag>:<payload>`.
#[derive(Debug)]
pub struct FileLogger {
    file: Mutex<Option<File>>,
    path: PathBuf,
    echo: bool,
}

impl FileLogger {
    /// Create `<prefix>_<YYYYmmddHHMMSS>.log`, creating parent directories.
    ///
    /// With `timestamp` false the file is `<prefix>.log`.
    pub fn create(prefix: impl AsRef<Path>, timestamp: bool) -> Result<Self> {
        let mut name = prefix.as_ref().as_os_str().to_owned();
        if timestamp {
            name.push(chrono::Local::now().format("_%Y%m%d%H%M%S").to_string());
        }
        name.push(".log");
        Self::create_at(PathBuf::from(name))
    }

    /// Create (truncate) the log file at exactly `path`.
    pub fn create_at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        tracing::debug!(path = %path.display(), "traffic log opened");
        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            echo: true,
        })
    }

    /// Disable or enable echoing entries to stdout (default: enabled).
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the file. Later entries are only echoed.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut file) = guard.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn write_entry(&self, tag: &str, payload: &[u8]) {
        // Stamp and echo under the lock so file order matches timestamp order.
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let line = format!("{nanos}:{tag}:{}", line_body(payload));
        if self.echo {
            print!("{line}");
        }
        if let Some(file) = guard.as_mut()
            && let Err(e) = file.write_all(line.as_bytes())
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write traffic log");
        }
    }
}

impl TrafficLogger for FileLogger {
    fn record(&self, target: &str, direction: Direction, payload: &[u8]) {
        self.write_entry(&entry_tag(direction.tag(), target), payload);
    }

    fn note(&self, target: &str, level: NoteLevel, message: &str) {
        self.write_entry(&entry_tag(level.tag(), target), message.as_bytes());
    }
}

impl Drop for FileLogger {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to flush traffic log");
        }
    }
}

/// Forwards traffic to `tracing` at DEBUG and notes at INFO or WARN.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl TrafficLogger for TracingLogger {
    fn record(&self, target: &str, direction: Direction, payload: &[u8]) {
        tracing::debug!(
            target_name = target,
            direction = direction.tag(),
            bytes = payload.len(),
            payload = %String::from_utf8_lossy(payload).escape_debug(),
            "traffic"
        );
    }

    fn note(&self, target: &str, level: NoteLevel, message: &str) {
        match level {
            NoteLevel::Info => tracing::info!(target_name = target, "{message}"),
            NoteLevel::Error => tracing::warn!(target_name = target, "{message}"),
        }
    }
}

/// Write-through adapter so any [`io::Write`] can serve as a traffic sink.
///
/// Lines have the same layout as [`FileLogger`] minus the timestamp:
/// `<tag>:<payload>`. Used by tests to capture a transcript in memory.
#[derive(Debug)]
pub struct WriterLogger<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterLogger<W> {
    /// Wrap `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Unwrap the inner writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entry(&self, tag: &str, payload: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write!(writer, "{tag}:{}", line_body(payload))
    }
}

impl<W: Write + Send> TrafficLogger for WriterLogger<W> {
    fn record(&self, target: &str, direction: Direction, payload: &[u8]) {
        let _ = self.write_entry(&entry_tag(direction.tag(), target), payload);
    }

    fn note(&self, target: &str, level: NoteLevel, message: &str) {
        let _ = self.write_entry(&entry_tag(level.tag(), target), message.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_body_appends_newline() {
        assert_eq!(line_body(b"hello"), "hello\n");
        assert_eq!(line_body(b"hello\r\n"), "hello\r\n");
        assert_eq!(line_body(b"prompt\r"), "prompt\r");
        assert_eq!(line_body(b""), "\n");
    }

    #[test]
    fn line_body_is_lossy_for_binary() {
        assert_eq!(line_body(&[0x66, 0xFF, 0x6F]), "f\u{FFFD}o\n");
    }

    #[test]
    fn tags() {
        assert_eq!(Direction::Outbound.tag(), "TX");
        assert_eq!(Direction::Inbound.tag(), "RX");
        assert_eq!(NoteLevel::Info.tag(), "--");
        assert_eq!(NoteLevel::Error.tag(), "ER");
    }

    #[test]
    fn writer_logger_transcript() {
        let logger = WriterLogger::new(Vec::new());
        logger.note("iut", NoteLevel::Info, "start receiver");
        logger.record("iut", Direction::Outbound, b"GET / HTTP/1.1\r\n\r\n");
        logger.record("iut", Direction::Inbound, b"HTTP/1.1 200 OK");
        logger.note("iut", NoteLevel::Error, "failed to receive");

        let text = String::from_utf8(logger.into_inner()).unwrap();
        assert_eq!(
            text,
            "--:iut:start receiver\n\
             TX:iut:GET / HTTP/1.1\r\n\r\n\
             RX:iut:HTTP/1.1 200 OK\n\
             ER:iut:failed to receive\n"
        );
    }

    #[test]
    fn file_logger_writes_timestamped_lines() {
        let dir = std::env::temp_dir().join(format!("tdriver-log-{}", std::process::id()));
        let path = dir.join("nested").join("run.log");
        let logger = FileLogger::create_at(&path).unwrap().echo(false);
        logger.record("a", Direction::Inbound, b"ping");
        logger.note("a", NoteLevel::Info, "receiver stopped");
        logger.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let (nanos, rest) = lines[0].split_once(':').unwrap();
        assert!(nanos.parse::<u128>().is_ok(), "bad timestamp: {nanos}");
        assert_eq!(rest, "RX:a:ping");
        assert!(lines[1].ends_with(":--:a:receiver stopped"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn file_logger_timestamps_follow_file_order() {
        let dir = std::env::temp_dir().join(format!("tdriver-order-{}", std::process::id()));
        let logger = std::sync::Arc::new(FileLogger::create_at(dir.join("run.log")).unwrap().echo(false));

        let writers: Vec<_> = (0..8)
            .map(|t| {
                let logger = logger.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        logger.record(&format!("t{t}"), Direction::Inbound, format!("{i}").as_bytes());
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        logger.close().unwrap();

        let text = std::fs::read_to_string(logger.path()).unwrap();
        let stamps: Vec<u128> = text
            .lines()
            .map(|line| line.split_once(':').unwrap().0.parse().unwrap())
            .collect();
        assert_eq!(stamps.len(), 8 * 200);
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "timestamps out of file order");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn file_logger_timestamped_name() {
        let dir = std::env::temp_dir().join(format!("tdriver-name-{}", std::process::id()));
        let logger = FileLogger::create(dir.join("cui"), true).unwrap().echo(false);
        let name = logger.path().file_name().unwrap().to_string_lossy().into_owned();
        // cui_YYYYmmddHHMMSS.log
        assert!(name.starts_with("cui_"), "{name}");
        assert!(name.ends_with(".log"), "{name}");
        assert_eq!(name.len(), "cui_".len() + 14 + ".log".len());
        drop(logger);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn null_logger_accepts_everything() {
        let logger = NullLogger;
        logger.record("", Direction::Inbound, b"data");
        logger.note("", NoteLevel::Error, "ignored");
    }
}
