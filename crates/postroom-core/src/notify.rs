//! Composing and enqueuing system-generated notifications.
//!
//! Everything postroom itself says — command replies, rejection notices,
//! owner alerts, digests — is injected into the virgin queue and takes
//! the same outgoing path as list traffic.

use anyhow::Result;
use postroom_message::{Message, make_message_id, rfc2822_now};
use postroom_switchboard::{Metadata, Switchboard};

use crate::list::MailingList;

/// A plain-text notification from the list to one recipient.
pub fn user_notification(
    list: &MailingList,
    recipient: &str,
    subject: &str,
    body: &str,
) -> Message {
    let mut msg = Message::text_plain(body, list.preferred_language.charset());
    msg.append("From", list.bounces_address());
    msg.append("To", recipient);
    msg.append("Subject", subject);
    msg.append("Message-ID", make_message_id(list.host_name()));
    msg.append("Date", rfc2822_now());
    msg.append("Precedence", "bulk");
    msg
}

/// Enqueue a synthesised message to the virgin queue with an explicit
/// recipient set.
pub fn enqueue_virgin(
    virgin: &Switchboard,
    list: &MailingList,
    msg: &Message,
    recipients: &[String],
) -> Result<()> {
    let mut meta = Metadata::new();
    meta.set_listname(&list.name);
    meta.set_recipients(recipients);
    virgin.enqueue(&msg.to_bytes(), &meta)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use postroom_types::QueueName;

    #[test]
    fn notification_is_addressed_from_bounces() {
        let list = MailingList::new("test@example.com", "Test").expect("list");
        let msg = user_notification(&list, "anne@example.com", "hello", "body text\n");
        assert_eq!(msg.get("from"), Some("test-bounces@example.com"));
        assert_eq!(msg.get("to"), Some("anne@example.com"));
        assert_eq!(msg.get("precedence"), Some("bulk"));
        assert!(msg.has("message-id"));
        assert!(msg.has("date"));
    }

    #[test]
    fn enqueue_virgin_records_recipients() {
        let td = tempfile::tempdir().expect("tempdir");
        let virgin = Switchboard::new(td.path(), QueueName::Virgin).expect("open");
        let list = MailingList::new("test@example.com", "Test").expect("list");
        let msg = user_notification(&list, "anne@example.com", "hello", "body\n");

        enqueue_virgin(&virgin, &list, &msg, &["anne@example.com".to_string()])
            .expect("enqueue");

        let ids = virgin.files().expect("files");
        assert_eq!(ids.len(), 1);
        let (_, meta) = virgin.dequeue(&ids[0]).expect("dequeue");
        assert_eq!(meta.listname(), Some("test@example.com"));
        assert_eq!(
            meta.recipients(),
            Some(vec!["anne@example.com".to_string()])
        );
    }
}
