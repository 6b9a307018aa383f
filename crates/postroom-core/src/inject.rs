//! Message injection: how external code (and the CLI) drops a message
//! into a spool, with the invariants every queued entry carries.

use anyhow::Result;
use postroom_message::{Message, make_message_id, rfc2822_now};
use postroom_switchboard::Metadata;
use postroom_types::QueueName;

use crate::Site;
use crate::list::MailingList;

/// Stamp missing Message-ID/Date headers, record the original size, and
/// enqueue to the named queue (normally `in`). Returns the entry id.
pub fn inject_message(
    site: &Site,
    list: &MailingList,
    raw: &[u8],
    recipients: Option<&[String]>,
    queue: QueueName,
) -> Result<String> {
    let mut msg = Message::parse(raw)?;
    msg.ensure("Message-ID", make_message_id(list.host_name()));
    msg.ensure("Date", rfc2822_now());

    let mut meta = Metadata::new();
    meta.set_listname(&list.name);
    meta.set_i64("original_size", raw.len() as i64);
    if let Some(recipients) = recipients {
        meta.set_recipients(recipients);
    }

    let board = site.queue(queue)?;
    Ok(board.enqueue(&msg.to_bytes(), &meta)?)
}
