//! Site context: configuration plus the shared resources every runner
//! needs — queues, logs, locks, the list store, and the pending store.

use std::path::PathBuf;

use anyhow::Result;
use postroom_config::Config;
use postroom_events::Logger;
use postroom_lock::{FileLock, LockError};
use postroom_pending::PendingStore;
use postroom_switchboard::Switchboard;
use postroom_types::QueueName;

use crate::list::FileListStore;

/// Lifetime after which an abandoned lock may be broken.
const LOCK_LIFETIME: std::time::Duration = std::time::Duration::from_secs(900);

/// Shared site context, cheap to clone into each runner.
#[derive(Debug, Clone)]
pub struct Site {
    config: Config,
    logger: Logger,
}

impl Site {
    pub fn new(config: Config) -> Self {
        let logger = Logger::new(config.log_dir());
        Self { config, logger }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Open (creating if needed) a standard queue.
    pub fn queue(&self, name: QueueName) -> Result<Switchboard> {
        Ok(Switchboard::new(self.config.queue_dir(), name)?)
    }

    /// Where held-for-moderation messages are parked, per list.
    pub fn held_queue(&self, listname: &str) -> Result<Switchboard> {
        Ok(Switchboard::at(
            self.config
                .data_dir()
                .join("held")
                .join(listname.to_ascii_lowercase()),
        )?)
    }

    pub fn list_store(&self) -> FileListStore {
        FileListStore::new(self.config.list_data_dir())
    }

    pub fn pending_store(&self) -> PendingStore {
        PendingStore::new(self.config.data_dir().join("pending"))
    }

    /// Acquire the per-list lock with the configured bounded timeout.
    pub fn lock_list(&self, listname: &str) -> Result<FileLock, LockError> {
        FileLock::acquire(
            self.config.lock_dir(),
            listname,
            self.config.list_lock_timeout(),
            LOCK_LIFETIME,
        )
    }

    /// Acquire the global MTA lock. Ordering discipline: this lock is
    /// always taken before any list lock.
    pub fn lock_mta(&self) -> Result<FileLock, LockError> {
        FileLock::acquire(
            self.config.lock_dir(),
            "mta",
            self.config.mta_lock_timeout(),
            LOCK_LIFETIME,
        )
    }

    /// Path of the generated alias map.
    pub fn alias_map_path(&self) -> PathBuf {
        self.config.data_dir().join("postfix_lmtp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_open_under_queue_dir() {
        let td = tempfile::tempdir().expect("tempdir");
        let toml = format!(
            "[dirs]\nqueue_dir = {:?}\ndata_dir = {:?}\nlog_dir = {:?}\n",
            td.path().join("q"),
            td.path().join("d"),
            td.path().join("l"),
        );
        std::fs::write(td.path().join("postroom.toml"), toml).expect("write");
        let site = Site::new(postroom_config::load_config(td.path()).expect("load"));

        let board = site.queue(QueueName::In).expect("open");
        assert!(board.dir().ends_with("in"));
        assert!(board.dir().starts_with(td.path()));
    }

    #[test]
    fn held_queue_is_per_list() {
        let td = tempfile::tempdir().expect("tempdir");
        let toml = format!("[dirs]\ndata_dir = {:?}\n", td.path().join("data"));
        std::fs::write(td.path().join("postroom.toml"), toml).expect("write");
        let site = Site::new(postroom_config::load_config(td.path()).expect("load"));

        let held = site.held_queue("Test@Example.Com").expect("open");
        assert!(held.dir().ends_with("held/test@example.com"));
    }
}
