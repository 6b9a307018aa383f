//! Digest assembly: turn an accumulated mbox into a MIME
//! `multipart/digest` and an RFC 1153 flat digest, enqueue both to the
//! virgin queue with the recipient partition, and advance the volume and
//! issue clock.
//!
//! The clock only moves after both enqueues succeed; an assembly failure
//! leaves the mbox and the counters untouched so the next accumulation
//! retries cleanly.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::Utc;
use postroom_message::{
    Body, Message, Multipart, make_message_id, messages as mbox_messages, parse_address,
    rfc2822_now, wrap,
};
use postroom_switchboard::{Metadata, Switchboard};
use postroom_types::Channel;
use regex::Regex;

use crate::Site;
use crate::handlers::decorate_template;
use crate::i18n::{Catalog, interpolate};
use crate::list::MailingList;

/// RFC 1153 header allow-list, in the order the digest presents them.
pub const KEEP: [&str; 13] = [
    "Date",
    "From",
    "To",
    "Cc",
    "Subject",
    "Message-ID",
    "Keywords",
    "In-Reply-To",
    "References",
    "Content-Type",
    "MIME-Version",
    "Content-Transfer-Encoding",
    "Precedence",
];

const SEPARATOR70: &str =
    "----------------------------------------------------------------------";
const SEPARATOR30: &str = "------------------------------";

/// Assemble and enqueue both digest flavours from mbox bytes.
///
/// An empty or unparseable mbox is skipped silently. On success the
/// volume/issue clock advances and `one_last_digest` is cleared.
pub fn send_digests(
    site: &Site,
    virgin: &Switchboard,
    list: &mut MailingList,
    mbox: &[u8],
) -> Result<()> {
    let parsed: Vec<Message> = mbox_messages(mbox)
        .filter_map(|raw| Message::parse(&raw).ok())
        .collect();
    if parsed.is_empty() {
        return Ok(());
    }

    let now = Utc::now();
    let (volume, issue) = if list.digest.needs_volume_bump(now) {
        (list.digest.volume + 1, 1)
    } else {
        (list.digest.volume, list.digest.next_digest_number)
    };

    let catalog = Catalog::new(list.preferred_language);
    let digest_id = catalog.digest_id(&list.real_name, volume, issue);
    let masthead = interpolate(
        catalog.masthead_template(),
        &[
            ("real_name", &list.real_name),
            ("got_list_email", list.posting_address()),
            ("got_request_email", &list.request_address()),
            ("got_owner_email", &list.owner_address()),
        ],
    );
    let header_text = list
        .digest
        .header
        .as_deref()
        .map(|t| decorate_template(list, t));
    let footer_text = list
        .digest
        .footer
        .as_deref()
        .map(|t| decorate_template(list, t));

    // Table of contents plus the header-stripped message sequence.
    let prefix_re = subject_prefix_re(&list.subject_prefix);
    let mut toc = String::new();
    toc.push_str(catalog.todays_topics_heading());
    toc.push_str("\n\n");
    let mut stripped = Vec::with_capacity(parsed.len());
    for (index, msg) in parsed.iter().enumerate() {
        let number = index + 1;
        push_toc_entry(&mut toc, number, msg, prefix_re.as_ref(), &catalog);
        stripped.push(strip_headers(msg, number));
    }

    let charset = list.preferred_language.charset();

    // MIME digest.
    let mut mime = Message::multipart("mixed");
    mime.append("From", list.request_address());
    mime.append("Subject", digest_id.clone());
    mime.append("To", list.posting_address());
    mime.append("Message-ID", make_message_id(list.host_name()));
    mime.append("Date", rfc2822_now());

    let mut masthead_part = Message::text_plain(masthead.clone(), charset);
    masthead_part.append("Content-Description", digest_id.clone());
    mime.attach(masthead_part)?;

    if let Some(text) = &header_text {
        let mut part = Message::text_plain(text.clone(), charset);
        part.append("Content-Description", catalog.digest_header());
        mime.attach(part)?;
    }

    let mut toc_part = Message::text_plain(toc.clone(), charset);
    toc_part.append("Content-Description", catalog.todays_topics(parsed.len()));
    mime.attach(toc_part)?;

    let mut inner = Message::new();
    inner.set_body(Body::Multipart(Multipart {
        subtype: "digest".to_string(),
        preamble: None,
        parts: stripped.clone(),
        postamble: None,
    }));
    mime.attach(inner)?;

    if let Some(text) = &footer_text {
        let mut part = Message::text_plain(text.clone(), charset);
        part.append("Content-Description", catalog.digest_footer());
        mime.attach(part)?;
    }

    let signoff = catalog.end_of(&digest_id);
    mime.set_postamble(signoff.clone())?;

    // RFC 1153 flat digest.
    let mut plain_body = String::new();
    plain_body.push_str(&masthead);
    plain_body.push_str("\n\n");
    if let Some(text) = &header_text {
        plain_body.push_str(text);
        plain_body.push_str("\n\n");
    }
    plain_body.push_str(&toc);
    plain_body.push('\n');
    plain_body.push_str(SEPARATOR70);
    plain_body.push_str("\n\n");
    for (index, msg) in stripped.iter().enumerate() {
        if index > 0 {
            plain_body.push_str(SEPARATOR30);
            plain_body.push_str("\n\n");
        }
        plain_body.push_str(&String::from_utf8_lossy(&msg.to_bytes()));
        if !plain_body.ends_with('\n') {
            plain_body.push('\n');
        }
    }
    if let Some(text) = &footer_text {
        // Strictly, RFC 1153 permits only the two trailer lines here;
        // keeping the footer above them is a deliberate deviation.
        plain_body.push_str(SEPARATOR30);
        plain_body.push_str("\n\n");
        plain_body.push_str(text);
        plain_body.push_str("\n\n");
    }
    plain_body.push_str(&signoff);
    plain_body.push('\n');
    plain_body.push_str(&"*".repeat(signoff.chars().count()));
    plain_body.push('\n');

    let mut rfc1153 = Message::text_plain(plain_body, charset);
    rfc1153.append("From", list.request_address());
    rfc1153.append("Subject", digest_id.clone());
    rfc1153.append("To", list.posting_address());
    rfc1153.append("Message-ID", make_message_id(list.host_name()));
    rfc1153.append("Date", rfc2822_now());

    // Partition the digest membership by format preference.
    let mut keys: BTreeSet<String> = list.roster.digest_member_keys().into_iter().collect();
    keys.extend(list.roster.one_last_digest.iter().cloned());
    let mut mime_recips = Vec::new();
    let mut plain_recips = Vec::new();
    for key in keys {
        let Some(member) = list.roster.get(&key) else {
            // one_last_digest can reference an address that unsubscribed.
            continue;
        };
        if !member.delivery_status.is_enabled() {
            continue;
        }
        if member.mime_digest {
            mime_recips.push(member.address.clone());
        } else {
            plain_recips.push(member.address.clone());
        }
    }

    let mut mime_meta = Metadata::new();
    mime_meta.set_listname(&list.name);
    mime_meta.set_recipients(&mime_recips);
    mime_meta.set_bool("isdigest", true);
    virgin
        .enqueue(&mime.to_bytes(), &mime_meta)
        .context("failed to enqueue MIME digest")?;

    let mut plain_meta = Metadata::new();
    plain_meta.set_listname(&list.name);
    plain_meta.set_recipients(&plain_recips);
    plain_meta.set_bool("isdigest", true);
    virgin
        .enqueue(&rfc1153.to_bytes(), &plain_meta)
        .context("failed to enqueue RFC 1153 digest")?;

    // Both digests are queued; now the clock may move.
    list.digest.volume = volume;
    list.digest.next_digest_number = issue + 1;
    list.digest.last_sent_at = Some(now);
    list.roster.one_last_digest.clear();

    site.logger().log(
        Channel::Digest,
        Some(&list.name),
        format!(
            "sent volume {volume} issue {issue}: {} MIME, {} plain recipients",
            mime_recips.len(),
            plain_recips.len()
        ),
    );
    Ok(())
}

/// `(re:? *)?(prefix)` — used to keep the redundant list prefix out of
/// the table of contents.
fn subject_prefix_re(prefix: &str) -> Option<Regex> {
    let prefix = prefix.trim_end();
    if prefix.is_empty() {
        return None;
    }
    Regex::new(&format!(r"(?i)^(re:?\s*)?({})\s*", regex::escape(prefix))).ok()
}

fn push_toc_entry(
    toc: &mut String,
    number: usize,
    msg: &Message,
    prefix_re: Option<&Regex>,
    catalog: &Catalog,
) {
    let mut subject = msg
        .subject()
        .unwrap_or_else(|| catalog.no_subject())
        .trim()
        .to_string();
    if let Some(re) = prefix_re
        && let Some(caps) = re.captures(&subject)
        && let Some(prefix_match) = caps.get(2)
    {
        let mut cleaned = String::new();
        cleaned.push_str(&subject[..prefix_match.start()]);
        cleaned.push_str(subject[prefix_match.end()..].trim_start());
        subject = cleaned.trim().to_string();
    }
    if subject.is_empty() {
        subject = catalog.no_subject().to_string();
    }

    let author = msg
        .get("from")
        .and_then(parse_address)
        .and_then(|(name, _)| name)
        .unwrap_or_default();

    let wrapped = wrap(&format!("{number:2}. {subject}"), 70);
    let mut lines: Vec<String> = wrapped.lines().map(str::to_string).collect();
    if !author.is_empty() {
        let attribution = format!(" ({author})");
        let last_len = lines.last().map_or(0, |l| l.chars().count());
        if last_len + attribution.chars().count() > 70 {
            lines.push(attribution.trim_start().to_string());
        } else if let Some(last) = lines.last_mut() {
            last.push_str(&attribution);
        }
    }
    for (index, line) in lines.iter().enumerate() {
        if index == 0 {
            toc.push_str("  ");
        } else {
            toc.push_str("     ");
        }
        toc.push_str(line);
        toc.push('\n');
    }
}

/// Retain only the allow-listed headers, reordered canonically, plus the
/// synthesised 1-based `Message:` index.
fn strip_headers(msg: &Message, number: usize) -> Message {
    let mut out = Message::new();
    for name in KEEP {
        for value in msg.get_all(name) {
            out.append(name, value.to_string());
        }
    }
    out.append("Message", number.to_string());
    out.set_body(msg.body().clone());
    out
}
