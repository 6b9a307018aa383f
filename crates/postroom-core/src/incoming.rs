//! The incoming runner: drains the `in` queue through the handler chain
//! under the per-list lock, mapping early exits to their queues.

use anyhow::{Context, Result, anyhow};
use postroom_lock::LockError;
use postroom_message::Message;
use postroom_switchboard::{Metadata, Switchboard};
use postroom_types::{Channel, QueueName};

use crate::Site;
use crate::handlers::default_chain;
use crate::list::{ListStore, MailingList};
use crate::notify::{enqueue_virgin, user_notification};
use crate::pipeline::{Handler, HandlerContext, PipelineError, run_chain};
use crate::runner::{Dispose, Disposition};

/// Disposal logic for the main delivery pipeline.
pub struct Incoming {
    site: Site,
    chain: Vec<Box<dyn Handler>>,
    virgin: Switchboard,
    out: Switchboard,
    archive: Switchboard,
}

impl Incoming {
    pub fn new(site: Site) -> Result<Self> {
        let virgin = site.queue(QueueName::Virgin)?;
        let out = site.queue(QueueName::Out)?;
        let archive = site.queue(QueueName::Archive)?;
        Ok(Self {
            site,
            chain: default_chain(),
            virgin,
            out,
            archive,
        })
    }

    /// Replace the handler chain (tests and embedders).
    pub fn with_chain(mut self, chain: Vec<Box<dyn Handler>>) -> Self {
        self.chain = chain;
        self
    }
}

impl Dispose for Incoming {
    fn dispose(&mut self, mut msg: Message, mut meta: Metadata) -> Result<Disposition> {
        let listname = meta
            .listname()
            .ok_or_else(|| anyhow!("entry has no listname"))?
            .to_string();
        let store = self.site.list_store();

        // All per-list mutation happens under the list lock; a timeout is
        // a transient condition, not a failure.
        let _lock = match self.site.lock_list(&listname) {
            Ok(lock) => lock,
            Err(LockError::Timeout { .. }) => return Ok(Disposition::Retry),
            Err(err) => return Err(err).context("list lock"),
        };

        let mut list = store.load(&listname)?;
        let ctx = HandlerContext {
            site: &self.site,
            virgin: &self.virgin,
            out: &self.out,
            archive: &self.archive,
        };

        match run_chain(&self.chain, &ctx, &mut list, &mut msg, &mut meta) {
            Ok(()) => {
                store.save(&list)?;
                Ok(Disposition::Finish)
            }
            Err(PipelineError::Discard) => {
                self.site.logger().log(
                    Channel::Vette,
                    Some(&listname),
                    format!(
                        "message from {} discarded",
                        msg.sender().unwrap_or_else(|| "<unknown>".to_string())
                    ),
                );
                Ok(Disposition::Finish)
            }
            Err(PipelineError::Reject(reason)) => {
                reject_message(&self.site, &self.virgin, &list, &msg, &reason)?;
                self.site.logger().log(
                    Channel::Vette,
                    Some(&listname),
                    format!("message rejected: {reason}"),
                );
                Ok(Disposition::Finish)
            }
            Err(PipelineError::Hold(reason)) => {
                hold_message(&self.site, &self.virgin, &list, &msg, &meta, &reason)?;
                store.save(&list)?;
                Ok(Disposition::Finish)
            }
            Err(PipelineError::Transient(reason)) => {
                self.site.logger().log(
                    Channel::Qrunner,
                    Some(&listname),
                    format!("transient failure, will retry: {reason}"),
                );
                Ok(Disposition::Retry)
            }
            Err(PipelineError::Fault(err)) => Err(err),
        }
    }
}

/// Bounce a rejected posting back to its sender with the reason.
fn reject_message(
    site: &Site,
    virgin: &Switchboard,
    list: &MailingList,
    msg: &Message,
    reason: &str,
) -> Result<()> {
    let Some(sender) = msg.sender() else {
        // Nobody to tell; the vette log entry is all we can do.
        site.logger()
            .log(Channel::Vette, Some(&list.name), "reject with no sender");
        return Ok(());
    };
    let body = format!(
        "Your message to the {} mailing list was rejected:\n\n    {}\n\n\
         If you believe this is in error, contact the list owner at\n{}.\n",
        list.real_name,
        reason,
        list.owner_address()
    );
    let notice = user_notification(
        list,
        &sender,
        &format!("Request to mailing list {} rejected", list.real_name),
        &body,
    );
    enqueue_virgin(virgin, list, &notice, &[sender])
}

/// Park a held message and notify the owner.
pub fn hold_message(
    site: &Site,
    virgin: &Switchboard,
    list: &MailingList,
    msg: &Message,
    meta: &Metadata,
    reason: &str,
) -> Result<()> {
    let held = site.held_queue(&list.name)?;
    let mut held_meta = meta.clone();
    held_meta.set_str("hold_reason", reason);
    held.enqueue(&msg.to_bytes(), &held_meta)?;

    site.logger().log(
        Channel::Vette,
        Some(&list.name),
        format!("message held: {reason}"),
    );

    if list.moderation.notify_owner_on_hold {
        let sender = msg.sender().unwrap_or_else(|| "<unknown>".to_string());
        let body = format!(
            "A posting to the {} mailing list from {} is being held for\n\
             your approval:\n\n    {}\n\nReason: {}\n",
            list.real_name,
            sender,
            msg.subject().unwrap_or("(no subject)"),
            reason
        );
        let notice = user_notification(
            list,
            &list.owner_address(),
            &format!("{} post from {} requires approval", list.real_name, sender),
            &body,
        );
        enqueue_virgin(virgin, list, &notice, &[list.owner_address()])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::{ListStore, Member};
    use crate::pipeline::test_support::chain_fixture;

    fn seeded_list(fx: &crate::pipeline::test_support::Fixture) -> MailingList {
        let mut list = fx.list();
        for addr in ["a@example.com", "b@example.com", "c@example.com"] {
            list.roster.subscribe(Member::new(addr, "pw"));
        }
        fx.site.list_store().save(&list).expect("save");
        list
    }

    fn dispose_raw(fx: &crate::pipeline::test_support::Fixture, raw: &[u8]) -> Disposition {
        let mut incoming = Incoming::new(fx.site.clone()).expect("incoming");
        let msg = Message::parse(raw).expect("parse");
        let mut meta = Metadata::new();
        meta.set_listname("test@example.com");
        incoming.dispose(msg, meta).expect("dispose")
    }

    #[test]
    fn member_posting_fans_out_with_prefix() {
        let (_td, fx) = chain_fixture();
        seeded_list(&fx);

        let disposition = dispose_raw(
            &fx,
            b"From: a@example.com\nTo: test@example.com\nSubject: hello\nMessage-ID: <m1>\n\nhi all\n",
        );
        assert_eq!(disposition, Disposition::Finish);

        let out = fx.site.queue(QueueName::Out).expect("out");
        let ids = out.files().expect("files");
        assert_eq!(ids.len(), 1);
        let (bytes, meta) = out.dequeue(&ids[0]).expect("dequeue");
        let delivered = Message::parse(&bytes).expect("parse");
        assert_eq!(delivered.subject(), Some("[Test] hello"));
        let mut recipients = meta.recipients().expect("recipients");
        recipients.sort_unstable();
        assert_eq!(
            recipients,
            vec![
                "a@example.com".to_string(),
                "b@example.com".to_string(),
                "c@example.com".to_string()
            ]
        );

        // One copy went to the archive queue too.
        let archive = fx.site.queue(QueueName::Archive).expect("archive");
        assert_eq!(archive.files().expect("files").len(), 1);
    }

    #[test]
    fn nonmember_posting_is_held_and_owner_notified() {
        let (_td, fx) = chain_fixture();
        seeded_list(&fx);

        let disposition = dispose_raw(
            &fx,
            b"From: stranger@example.net\nTo: test@example.com\nSubject: spam?\n\nbuy things\n",
        );
        assert_eq!(disposition, Disposition::Finish);

        // Nothing fanned out.
        let out = fx.site.queue(QueueName::Out).expect("out");
        assert!(out.files().expect("files").is_empty());

        // Parked in the held area with the reason recorded.
        let held = fx.site.held_queue("test@example.com").expect("held");
        let ids = held.files().expect("files");
        assert_eq!(ids.len(), 1);
        let (_, meta) = held.dequeue(&ids[0]).expect("dequeue");
        assert!(
            meta.get_str("hold_reason")
                .expect("reason")
                .contains("non-member")
        );

        // Owner notification in virgin.
        let virgin = fx.site.queue(QueueName::Virgin).expect("virgin");
        let vids = virgin.files().expect("files");
        assert_eq!(vids.len(), 1);
        let (bytes, _) = virgin.dequeue(&vids[0]).expect("dequeue");
        let notice = Message::parse(&bytes).expect("parse");
        assert_eq!(notice.get("to"), Some("test-owner@example.com"));
    }

    #[test]
    fn held_list_state_is_persisted() {
        let (_td, fx) = chain_fixture();
        let list = seeded_list(&fx);

        dispose_raw(
            &fx,
            b"From: a@example.com\nTo: test@example.com\nSubject: post\n\nbody\n",
        );

        // post_id advanced and was saved.
        let reloaded = fx.site.list_store().load(&list.name).expect("load");
        assert_eq!(reloaded.bounce.post_id, 1);
    }

    #[test]
    fn lock_timeout_requeues() {
        let (_td, fx) = chain_fixture();
        seeded_list(&fx);

        // Hold the list lock so dispose cannot take it. The configured
        // default timeout is 30s, so shrink it via a custom config.
        let _held = fx.site.lock_list("test@example.com").expect("lock");

        let toml = format!(
            "[dirs]\nqueue_dir = {:?}\ndata_dir = {:?}\nlog_dir = {:?}\nlist_data_dir = {:?}\nlock_dir = {:?}\n[locks]\nlist_lock_timeout_secs = 0\n",
            fx.site.config().queue_dir(),
            fx.site.config().data_dir(),
            fx.site.config().log_dir(),
            fx.site.config().list_data_dir(),
            fx.site.config().lock_dir(),
        );
        let td2 = tempfile::tempdir().expect("tempdir");
        std::fs::write(td2.path().join("postroom.toml"), toml).expect("write");
        let fast_site = Site::new(postroom_config::load_config(td2.path()).expect("load"));

        let mut incoming = Incoming::new(fast_site).expect("incoming");
        let msg = Message::parse(b"From: a@example.com\n\nbody\n").expect("parse");
        let mut meta = Metadata::new();
        meta.set_listname("test@example.com");
        let disposition = incoming.dispose(msg, meta).expect("dispose");
        assert_eq!(disposition, Disposition::Retry);
    }
}
