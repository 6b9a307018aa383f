//! The generic queue-runner loop.
//!
//! A runner drains one switchboard: recover leftovers once, then list,
//! dequeue, dispose, and finish or requeue, in id order. Unexpected
//! errors move the entry to the shunt queue for operator triage;
//! unparseable message bytes go to the bad queue. The loop never aborts
//! on a per-entry failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use postroom_events::Logger;
use postroom_message::Message;
use postroom_switchboard::{Metadata, Switchboard, SwitchboardError};
use postroom_types::Channel;

/// What to do with a disposed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; delete the entry.
    Finish,
    /// Transient failure; requeue for a later cycle.
    Retry,
}

/// Per-queue disposal logic.
pub trait Dispose {
    fn dispose(&mut self, msg: Message, meta: Metadata) -> Result<Disposition>;

    /// Invoked every `refresh_every` entries, e.g. to reload site state.
    fn refresh(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A long-lived loop draining one switchboard.
pub struct Runner<D> {
    name: &'static str,
    board: Switchboard,
    shunt: Switchboard,
    bad: Switchboard,
    logger: Logger,
    stop: Arc<AtomicBool>,
    sleep_interval: Duration,
    refresh_every: u32,
    processed: u64,
    disposer: D,
}

impl<D: Dispose> Runner<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &'static str,
        board: Switchboard,
        shunt: Switchboard,
        bad: Switchboard,
        logger: Logger,
        sleep_interval: Duration,
        refresh_every: u32,
        disposer: D,
    ) -> Self {
        Self {
            name,
            board,
            shunt,
            bad,
            logger,
            stop: Arc::new(AtomicBool::new(false)),
            sleep_interval,
            refresh_every,
            processed: 0,
            disposer,
        }
    }

    /// The shared stop flag, checked between entries.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Route SIGTERM and SIGINT to the stop flag.
    pub fn install_signal_handlers(&self) -> Result<()> {
        for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
            signal_hook::flag::register(signal, Arc::clone(&self.stop))
                .context("failed to register signal handler")?;
        }
        Ok(())
    }

    /// Access the disposer, mainly for tests.
    pub fn disposer(&self) -> &D {
        &self.disposer
    }

    /// Rehabilitate in-flight entries left by a crashed predecessor.
    /// `run` does this itself; single-drain callers do it explicitly.
    pub fn recover(&self) -> Result<u32> {
        Ok(self.board.recover()?)
    }

    /// Run until a stop sentinel or the stop flag. Per-entry failures are
    /// logged and shunted; only startup-level errors return `Err`.
    pub fn run(&mut self) -> Result<()> {
        let recovered = self.board.recover()?;
        if recovered > 0 {
            self.logger.log(
                Channel::Qrunner,
                None,
                format!("{}: recovered {recovered} in-flight entries", self.name),
            );
        }
        self.logger
            .log(Channel::Qrunner, None, format!("{} started", self.name));

        loop {
            let saw_sentinel = self.run_once()?;
            if saw_sentinel || self.stop.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(self.sleep_interval);
        }

        self.logger
            .log(Channel::Qrunner, None, format!("{} stopped", self.name));
        Ok(())
    }

    /// Drain the entries currently listed, in id order. Returns whether a
    /// stop sentinel was consumed.
    pub fn run_once(&mut self) -> Result<bool> {
        for id in self.board.files()? {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(false);
            }

            let (bytes, meta) = match self.board.dequeue(&id) {
                Ok(entry) => entry,
                Err(SwitchboardError::Missing { .. }) => continue,
                Err(err @ SwitchboardError::UnknownVersion { .. })
                | Err(err @ SwitchboardError::CorruptMetadata { .. }) => {
                    self.logger.log(
                        Channel::Error,
                        None,
                        format!("{}: shunting entry {id}: {err}", self.name),
                    );
                    self.board.requeue(&id, &self.shunt)?;
                    continue;
                }
                Err(err) => {
                    self.logger.log(
                        Channel::Error,
                        None,
                        format!("{}: cannot dequeue {id}: {err}", self.name),
                    );
                    continue;
                }
            };

            if meta.is_stop() {
                self.board.finish(&id)?;
                return Ok(true);
            }

            let msg = match Message::parse(&bytes) {
                Ok(msg) => msg,
                Err(err) => {
                    self.logger.log(
                        Channel::Error,
                        None,
                        format!("{}: unparseable message {id}: {err:#}", self.name),
                    );
                    self.board.requeue(&id, &self.bad)?;
                    continue;
                }
            };

            match self.disposer.dispose(msg, meta) {
                Ok(Disposition::Finish) => self.board.finish(&id)?,
                Ok(Disposition::Retry) => self.board.requeue(&id, &self.board)?,
                Err(err) => {
                    self.logger.log(
                        Channel::Error,
                        None,
                        format!("{}: dispose failed for {id}, shunting: {err:#}", self.name),
                    );
                    self.board.requeue(&id, &self.shunt)?;
                }
            }

            self.processed += 1;
            if self.refresh_every > 0 && self.processed % u64::from(self.refresh_every) == 0 {
                self.disposer.refresh()?;
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postroom_types::QueueName;
    use tempfile::tempdir;

    struct Script {
        outcomes: Vec<Result<Disposition>>,
        seen: Vec<String>,
        refreshes: u32,
    }

    impl Dispose for Script {
        fn dispose(&mut self, msg: Message, _meta: Metadata) -> Result<Disposition> {
            self.seen
                .push(msg.subject().unwrap_or_default().to_string());
            if self.outcomes.is_empty() {
                Ok(Disposition::Finish)
            } else {
                self.outcomes.remove(0)
            }
        }

        fn refresh(&mut self) -> Result<()> {
            self.refreshes += 1;
            Ok(())
        }
    }

    fn runner_fixture(
        root: &std::path::Path,
        outcomes: Vec<Result<Disposition>>,
    ) -> (Runner<Script>, Switchboard, Switchboard, Switchboard) {
        let board = Switchboard::new(root, QueueName::In).expect("board");
        let shunt = Switchboard::new(root, QueueName::Shunt).expect("shunt");
        let bad = Switchboard::new(root, QueueName::Bad).expect("bad");
        let runner = Runner::new(
            "test-runner",
            board.clone(),
            shunt.clone(),
            bad.clone(),
            Logger::new(root.join("logs")),
            Duration::from_millis(1),
            0,
            Script {
                outcomes,
                seen: Vec::new(),
                refreshes: 0,
            },
        );
        (runner, board, shunt, bad)
    }

    fn enqueue_subject(board: &Switchboard, subject: &str) -> String {
        let raw = format!("From: a@example.com\nSubject: {subject}\n\nbody\n");
        board
            .enqueue(raw.as_bytes(), &Metadata::new())
            .expect("enqueue")
    }

    #[test]
    fn entries_are_disposed_in_id_order() {
        let td = tempdir().expect("tempdir");
        let (mut runner, board, ..) = runner_fixture(td.path(), Vec::new());

        for subject in ["one", "two", "three"] {
            enqueue_subject(&board, subject);
            std::thread::sleep(Duration::from_millis(2));
        }

        let sentinel = runner.run_once().expect("run");
        assert!(!sentinel);
        assert_eq!(runner.disposer().seen, ["one", "two", "three"]);
        assert!(board.files().expect("files").is_empty());
    }

    #[test]
    fn retry_puts_the_entry_back() {
        let td = tempdir().expect("tempdir");
        let (mut runner, board, ..) = runner_fixture(td.path(), vec![Ok(Disposition::Retry)]);

        let id = enqueue_subject(&board, "flaky");
        runner.run_once().expect("run");
        assert_eq!(board.files().expect("files"), vec![id]);
    }

    #[test]
    fn dispose_error_shunts_the_entry() {
        let td = tempdir().expect("tempdir");
        let (mut runner, board, shunt, _) =
            runner_fixture(td.path(), vec![Err(anyhow::anyhow!("boom"))]);

        enqueue_subject(&board, "explodes");
        runner.run_once().expect("run");
        assert!(board.files().expect("files").is_empty());
        assert_eq!(shunt.files().expect("files").len(), 1);
    }

    #[test]
    fn unparseable_message_goes_to_bad() {
        let td = tempdir().expect("tempdir");
        let (mut runner, board, shunt, bad) = runner_fixture(td.path(), Vec::new());

        board.enqueue(b"", &Metadata::new()).expect("enqueue");
        runner.run_once().expect("run");
        assert!(board.files().expect("files").is_empty());
        assert!(shunt.files().expect("files").is_empty());
        assert_eq!(bad.files().expect("files").len(), 1);
        assert!(runner.disposer().seen.is_empty());
    }

    #[test]
    fn unknown_schema_version_is_shunted() {
        let td = tempdir().expect("tempdir");
        let (mut runner, board, shunt, _) = runner_fixture(td.path(), Vec::new());

        let id = enqueue_subject(&board, "future");
        std::fs::write(board.dir().join(format!("{id}.pck")), r#"{"version": 99}"#)
            .expect("write");
        runner.run_once().expect("run");
        assert_eq!(shunt.files().expect("files").len(), 1);
        assert!(runner.disposer().seen.is_empty());
    }

    #[test]
    fn stop_sentinel_breaks_cleanly() {
        let td = tempdir().expect("tempdir");
        let (mut runner, board, ..) = runner_fixture(td.path(), Vec::new());

        enqueue_subject(&board, "before");
        std::thread::sleep(Duration::from_millis(2));
        board.enqueue_stop().expect("stop");
        std::thread::sleep(Duration::from_millis(2));
        enqueue_subject(&board, "after");

        let sentinel = runner.run_once().expect("run");
        assert!(sentinel);
        // The entry before the sentinel was processed; the one after
        // stays queued for the next incarnation.
        assert_eq!(runner.disposer().seen, ["before"]);
        assert_eq!(board.files().expect("files").len(), 1);
    }

    #[test]
    fn stop_flag_halts_between_entries() {
        let td = tempdir().expect("tempdir");
        let (mut runner, board, ..) = runner_fixture(td.path(), Vec::new());

        enqueue_subject(&board, "never");
        runner.stop_flag().store(true, Ordering::SeqCst);
        runner.run_once().expect("run");
        assert!(runner.disposer().seen.is_empty());
        assert_eq!(board.files().expect("files").len(), 1);
    }

    #[test]
    fn run_recovers_crashed_entries_before_draining() {
        let td = tempdir().expect("tempdir");
        let (mut runner, board, ..) = runner_fixture(td.path(), Vec::new());

        let id = enqueue_subject(&board, "crashed");
        board.dequeue(&id).expect("dequeue");
        // Simulated crash: .bak pair left behind. run() recovers, drains,
        // then hits the sentinel and stops.
        std::thread::sleep(Duration::from_millis(2));
        board.enqueue_stop().expect("stop");
        runner.run().expect("run");
        assert_eq!(runner.disposer().seen, ["crashed"]);
    }
}
