//! Channelled JSONL event logging for postroom.
//!
//! Runners are long-lived processes, so events are appended to disk the
//! moment they are recorded, one file per channel (`vette.jsonl`,
//! `bounce.jsonl`, ...). The in-memory [`EventLog`] reader exists for
//! tests and operator triage.
//!
//! # Example
//!
//! ```
//! use postroom_events::Logger;
//! use postroom_types::Channel;
//!
//! let dir = tempfile::tempdir().expect("tempdir");
//! let logger = Logger::new(dir.path());
//! logger.log(Channel::Vette, Some("test@example.com"), "Precedence: bulk discarded");
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use postroom_types::{Channel, LogEvent};

/// Get the log file path for a channel inside a log directory.
pub fn channel_path(log_dir: &Path, channel: Channel) -> PathBuf {
    log_dir.join(format!("{}.jsonl", channel.file_stem()))
}

/// Handle for appending events; cheap to clone into each runner.
#[derive(Debug, Clone)]
pub struct Logger {
    log_dir: PathBuf,
}

impl Logger {
    /// Create a logger rooted at `log_dir`. The directory is created lazily
    /// on first write.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    /// The directory events are written under.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Append one event to its channel file.
    ///
    /// Logging must never take a runner down, so failures are swallowed
    /// after a best-effort stderr note.
    pub fn log(&self, channel: Channel, listname: Option<&str>, message: impl Into<String>) {
        let event = LogEvent::now(channel, listname, message);
        if let Err(err) = self.append(&event) {
            eprintln!("[error] event log write failed: {err:#}");
        }
    }

    fn append(&self, event: &LogEvent) -> Result<()> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create log dir {}", self.log_dir.display()))?;
        let path = channel_path(&self.log_dir, event.channel);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        let line = serde_json::to_string(event).context("failed to serialize event")?;
        writeln!(writer, "{}", line).context("failed to write event line")?;
        writer.flush().context("failed to flush event log")?;
        Ok(())
    }
}

/// In-memory view of one channel's recorded events.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<LogEvent>,
}

impl EventLog {
    /// Create a new empty event log.
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Read all events recorded for `channel` under `log_dir`.
    pub fn read(log_dir: &Path, channel: Channel) -> Result<Self> {
        let path = channel_path(log_dir, channel);
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line
                .with_context(|| format!("failed to read line from {}", path.display()))?;
            let event: LogEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {}", line))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    /// All events for a specific list.
    pub fn events_for_list(&self, listname: &str) -> Vec<&LogEvent> {
        self.events
            .iter()
            .filter(|e| e.listname.as_deref() == Some(listname))
            .collect()
    }

    /// All recorded events in order.
    pub fn all_events(&self) -> &[LogEvent] {
        &self.events
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn log_appends_one_line_per_event() {
        let td = tempdir().expect("tempdir");
        let logger = Logger::new(td.path());

        logger.log(Channel::Vette, None, "first");
        logger.log(Channel::Vette, Some("test@example.com"), "second");

        let log = EventLog::read(td.path(), Channel::Vette).expect("read");
        assert_eq!(log.len(), 2);
        assert_eq!(log.all_events()[0].message, "first");
        assert_eq!(log.all_events()[1].message, "second");
    }

    #[test]
    fn channels_do_not_mix() {
        let td = tempdir().expect("tempdir");
        let logger = Logger::new(td.path());

        logger.log(Channel::Vette, None, "vetted");
        logger.log(Channel::Bounce, None, "bounced");

        let vette = EventLog::read(td.path(), Channel::Vette).expect("read");
        let bounce = EventLog::read(td.path(), Channel::Bounce).expect("read");
        assert_eq!(vette.len(), 1);
        assert_eq!(bounce.len(), 1);
        assert_eq!(bounce.all_events()[0].message, "bounced");
    }

    #[test]
    fn read_missing_channel_is_empty() {
        let td = tempdir().expect("tempdir");
        let log = EventLog::read(td.path(), Channel::Digest).expect("read");
        assert!(log.is_empty());
    }

    #[test]
    fn events_for_list_filters() {
        let td = tempdir().expect("tempdir");
        let logger = Logger::new(td.path());

        logger.log(Channel::Bounce, Some("a@example.com"), "one");
        logger.log(Channel::Bounce, Some("b@example.com"), "two");
        logger.log(Channel::Bounce, Some("a@example.com"), "three");

        let log = EventLog::read(td.path(), Channel::Bounce).expect("read");
        assert_eq!(log.events_for_list("a@example.com").len(), 2);
        assert_eq!(log.events_for_list("b@example.com").len(), 1);
        assert_eq!(log.events_for_list("c@example.com").len(), 0);
    }

    #[test]
    fn log_dir_created_lazily() {
        let td = tempdir().expect("tempdir");
        let nested = td.path().join("logs").join("deep");
        let logger = Logger::new(&nested);
        assert!(!nested.exists());

        logger.log(Channel::Qrunner, None, "started");
        assert!(channel_path(&nested, Channel::Qrunner).exists());
    }
}
