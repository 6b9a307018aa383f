//! Bounce recognition and scoring.
//!
//! Delivery-status mail is scanned line by line with two pattern tables:
//! SMTP-reply-code forms that embed an address token, and vendor-specific
//! plain-text forms whose local part is joined with the bounce
//! originator's domain. Matches either remove the member outright (hard
//! failures) or feed the per-address bounce record (soft failures), which
//! retires an address once it has bounced across enough posts and enough
//! wall-clock time.

use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use postroom_lock::LockError;
use postroom_message::{Message, split_address};
use postroom_switchboard::{Metadata, Switchboard};
use postroom_types::{Channel, QueueName};
use regex::Regex;

use crate::Site;
use crate::list::{BounceRecord, MailingList};
use crate::notify::{enqueue_virgin, user_notification};
use crate::runner::{Dispose, Disposition};

/// Hard failure: remove the member. Soft failure: score it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceAction {
    Bounce,
    Remove,
}

/// Addresses extracted from one bounce message, in scan order. Removals
/// are deduplicated within the scan.
#[derive(Debug, Default, PartialEq)]
pub struct ScanOutcome {
    pub remove: Vec<String>,
    pub bounce: Vec<String>,
}

impl ScanOutcome {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.bounce.is_empty()
    }
}

/// Sender local parts that mark a message as machine-generated
/// delivery status.
const BOUNCE_SENDERS: [&str; 6] = [
    "mailer-daemon",
    "postmaster",
    "orphanage",
    "postoffice",
    "ucx_smtp",
    "a2",
];

const EMAIL_TOKEN: &str = r"<?[^ \t@<>]+@[^ \t@<>]+\.[^ \t<>.]+>?";

struct Patterns {
    simple: Vec<(Regex, BounceAction)>,
    email: Regex,
    recipient: Regex,
    addressee: Regex,
    not_listed: Regex,
    user_unknown_550: Regex,
    not_defined: Regex,
    colon_unknown: Regex,
    disabled: Regex,
    dsn_markers: Vec<Regex>,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let simple = vec![
            (format!(r"451 {EMAIL_TOKEN}"), BounceAction::Bounce),
            (format!(r"554 {EMAIL_TOKEN}"), BounceAction::Bounce),
            (format!(r"552 {EMAIL_TOKEN}"), BounceAction::Bounce),
            (format!(r"501 {EMAIL_TOKEN}"), BounceAction::Bounce),
            (format!(r"553 {EMAIL_TOKEN}"), BounceAction::Bounce),
            (format!(r"550 {EMAIL_TOKEN}"), BounceAction::Remove),
            (format!(r"{EMAIL_TOKEN} .bounced"), BounceAction::Bounce),
            (format!(r"{EMAIL_TOKEN}\.\.\. Deferred"), BounceAction::Bounce),
            (format!(r"User {EMAIL_TOKEN} not known"), BounceAction::Remove),
            (format!(r"{EMAIL_TOKEN}: User unknown"), BounceAction::Remove),
        ];
        Patterns {
            simple: simple
                .into_iter()
                .map(|(p, action)| (Regex::new(&p).expect("static pattern"), action))
                .collect(),
            email: Regex::new(EMAIL_TOKEN).expect("static pattern"),
            recipient: Regex::new(r"^Recipient .*$").expect("static pattern"),
            addressee: Regex::new(r"^Addressee: .*$").expect("static pattern"),
            not_listed: Regex::new(r"^User .* not listed").expect("static pattern"),
            user_unknown_550: Regex::new(r"^550 [^ ]+\.\.\. User unknown")
                .expect("static pattern"),
            not_defined: Regex::new(r"^User [^ ]+ is not defined").expect("static pattern"),
            colon_unknown: Regex::new(r"^[ \t]*[^ ]+: User unknown").expect("static pattern"),
            disabled: Regex::new(r"^[^ ]+ - User currently disabled").expect("static pattern"),
            dsn_markers: [
                r"(?m)^.*Message header follows.*$",
                r"(?m)^The text you sent follows:.*$",
                r"(?m)^Additional Message Information:.*$",
                r"(?m)^-+\s*Your original message\s*-+.*$",
            ]
            .iter()
            .map(|p| Regex::new(p).expect("static pattern"))
            .collect(),
        }
    })
}

/// Scan a message that might be a bounce. `None` means the sender gate
/// rejected it; an empty outcome means it was scanned but nothing was
/// recognised.
pub fn scan_message(msg: &Message) -> Option<ScanOutcome> {
    let sender = msg.sender()?;
    let (local, domain) = split_address(&sender)?;
    if !BOUNCE_SENDERS.contains(&local.as_str()) {
        return None;
    }

    let region = relevant_region(msg);
    let p = patterns();

    let mut outcome = ScanOutcome::default();
    let push_remove = |outcome: &mut ScanOutcome, addr: String| {
        if !outcome.remove.contains(&addr) {
            outcome.remove.push(addr);
        }
    };

    'line: for line in region.lines() {
        for (pattern, action) in &p.simple {
            if pattern.is_match(line) {
                let Some(email) = extract_address(line) else {
                    continue;
                };
                for addr in email.split(',') {
                    let addr = addr.trim().to_string();
                    if addr.is_empty() {
                        continue;
                    }
                    match action {
                        BounceAction::Remove => push_remove(&mut outcome, addr),
                        BounceAction::Bounce => outcome.bounce.push(addr),
                    }
                }
                continue 'line;
            }
        }

        // Vendor forms where the address has to be reassembled from a
        // positional field plus the originator's domain.
        let second_token =
            |line: &str| line.split_whitespace().nth(1).map(str::to_string);
        if p.recipient.is_match(line) || p.addressee.is_match(line) {
            if let Some(user) = second_token(line) {
                outcome.bounce.push(format!("{user}@{domain}"));
            }
            continue;
        }
        if p.not_listed.is_match(line)
            || p.user_unknown_550.is_match(line)
            || p.not_defined.is_match(line)
        {
            if let Some(user) = second_token(line) {
                push_remove(&mut outcome, format!("{user}@{domain}"));
            }
            continue;
        }
        if p.colon_unknown.is_match(line) {
            if let Some(token) = line.trim().split_whitespace().next() {
                let user = token.trim_end_matches(':');
                push_remove(&mut outcome, format!("{user}@{domain}"));
            }
            continue;
        }
        if p.disabled.is_match(line)
            && let Some(user) = line.trim().split_whitespace().next()
        {
            push_remove(&mut outcome, format!("{user}@{domain}"));
        }
    }

    Some(outcome)
}

/// The text region worth scanning: the first sub-part after the MIME
/// boundary for multiparts, otherwise the body up to the first DSN
/// preamble/postamble marker.
fn relevant_region(msg: &Message) -> String {
    use postroom_message::Body;

    let body = match msg.body() {
        Body::Multipart(mp) => {
            return mp
                .parts
                .first()
                .map(|part| String::from_utf8_lossy(&part.to_bytes()).to_string())
                .unwrap_or_default();
        }
        Body::Text(text) => text.clone(),
        Body::Raw(bytes) => String::from_utf8_lossy(bytes).to_string(),
        Body::Rfc822(inner) => String::from_utf8_lossy(&inner.to_bytes()).to_string(),
    };

    let mut region = body;
    for marker in &patterns().dsn_markers {
        if let Some(found) = marker.find(&region) {
            region.truncate(found.start());
        }
    }
    region
}

fn extract_address(line: &str) -> Option<String> {
    let m = patterns().email.find(line)?;
    Some(
        m.as_str()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string(),
    )
}

/// Score one soft bounce against the member's record.
pub fn register_bounce(site: &Site, virgin: &Switchboard, list: &mut MailingList, email: &str) -> Result<()> {
    let key = email.to_ascii_lowercase();
    let now = Utc::now();
    let report = format!("Bouncing {email} on list {}", list.real_name);

    let Some(member) = list.roster.get(&key).cloned() else {
        site.logger().log(
            Channel::Bounce,
            Some(&list.name),
            format!("{report} - not a member"),
        );
        return Ok(());
    };

    // Digest members are clocked by volume; everyone else by post id.
    let clock = if member.digest {
        u64::from(list.digest.volume)
    } else {
        list.bounce.post_id
    };

    let Some(record) = list.bounce.records.get(&key).cloned() else {
        list.bounce
            .records
            .insert(key.clone(), BounceRecord::new(now, clock));
        site.logger().log(
            Channel::Bounce,
            Some(&list.name),
            format!("{report} - first bounce"),
        );
        return Ok(());
    };

    let age = now - record.first_seen;
    let removal_age = chrono::Duration::days(i64::from(list.bounce.minimum_removal_days));

    if member.digest {
        if clock > record.first_post_id {
            // A bounce in a newer volume restarts a stale record.
            list.bounce
                .records
                .insert(key.clone(), BounceRecord::new(now, clock));
            site.logger().log(
                Channel::Bounce,
                Some(&list.name),
                format!("{report} - first fresh bounce on a stale digest address"),
            );
            return Ok(());
        }
        if age > removal_age {
            site.logger().log(
                Channel::Bounce,
                Some(&list.name),
                format!("{report} - digest member removed"),
            );
            return remove_bouncing_address(site, virgin, list, &key);
        }
        site.logger().log(
            Channel::Bounce,
            Some(&list.name),
            format!("{report} - digest member still within grace"),
        );
        return Ok(());
    }

    if clock.saturating_sub(record.last_post_id) > u64::from(list.bounce.max_posts_between_bounces)
    {
        // The old record is stale; this is effectively a new first bounce.
        list.bounce
            .records
            .insert(key.clone(), BounceRecord::new(now, clock));
        site.logger().log(
            Channel::Bounce,
            Some(&list.name),
            format!("{report} - first fresh bounce on a stale address"),
        );
        return Ok(());
    }

    let mut updated = record.clone();
    updated.last_post_id = clock;
    list.bounce.records.insert(key.clone(), updated);

    let posts_since_first = clock.saturating_sub(record.first_post_id);
    if posts_since_first > u64::from(list.bounce.minimum_post_count_before_removal)
        && age > removal_age
    {
        site.logger().log(
            Channel::Bounce,
            Some(&list.name),
            format!("{report} - threshold crossed, removing"),
        );
        return remove_bouncing_address(site, virgin, list, &key);
    }

    let remaining = u64::from(list.bounce.minimum_post_count_before_removal)
        .saturating_sub(posts_since_first);
    let remaining_secs = (removal_age - age).num_seconds().max(0);
    site.logger().log(
        Channel::Bounce,
        Some(&list.name),
        format!("{report} - {remaining} more posts, {remaining_secs} more seconds"),
    );
    Ok(())
}

/// Remove (or report) a hard-bouncing address and clear its record.
pub fn remove_bouncing_address(
    site: &Site,
    virgin: &Switchboard,
    list: &mut MailingList,
    email: &str,
) -> Result<()> {
    let key = email.to_ascii_lowercase();
    if list.bounce.auto_remove {
        if list.roster.remove(&key).is_ok() {
            site.logger().log(
                Channel::Bounce,
                Some(&list.name),
                format!("{email} removed from {}", list.real_name),
            );
            if list.bounce.notify_owner_on_removal {
                let body = format!(
                    "{email} has been removed from the {} mailing list because\n\
                     mail to that address kept bouncing.\n",
                    list.real_name
                );
                let notice = user_notification(
                    list,
                    &list.owner_address(),
                    &format!("{email} removed from {} (bouncing)", list.real_name),
                    &body,
                );
                enqueue_virgin(virgin, list, &notice, &[list.owner_address()])?;
            }
        }
    } else {
        let body = format!(
            "{email} on the {} mailing list is bouncing and has crossed the\n\
             removal thresholds. Automatic removal is off; no action was taken.\n",
            list.real_name
        );
        let notice = user_notification(
            list,
            &list.owner_address(),
            &format!("{email} is bouncing on {}", list.real_name),
            &body,
        );
        enqueue_virgin(virgin, list, &notice, &[list.owner_address()])?;
    }
    list.bounce.clear(&key);
    Ok(())
}

/// Disposal logic for the bounce queue.
pub struct BounceScanner {
    site: Site,
    virgin: Switchboard,
}

impl BounceScanner {
    pub fn new(site: Site) -> Result<Self> {
        let virgin = site.queue(QueueName::Virgin)?;
        Ok(Self { site, virgin })
    }
}

impl Dispose for BounceScanner {
    fn dispose(&mut self, msg: Message, meta: Metadata) -> Result<Disposition> {
        let listname = meta
            .listname()
            .ok_or_else(|| anyhow!("bounce entry has no listname"))?
            .to_string();

        let Some(outcome) = scan_message(&msg) else {
            self.site.logger().log(
                Channel::Bounce,
                Some(&listname),
                "message not from a recognised bounce sender, dropped",
            );
            return Ok(Disposition::Finish);
        };
        if outcome.is_empty() {
            self.site.logger().log(
                Channel::Bounce,
                Some(&listname),
                "bounce message with no discernible addresses",
            );
            return Ok(Disposition::Finish);
        }

        let _lock = match self.site.lock_list(&listname) {
            Ok(lock) => lock,
            Err(LockError::Timeout { .. }) => return Ok(Disposition::Retry),
            Err(err) => return Err(err).context("list lock"),
        };

        let store = self.site.list_store();
        use crate::list::ListStore;
        let mut list = store.load(&listname)?;
        if !list.bounce.process_bounces {
            return Ok(Disposition::Finish);
        }

        for addr in &outcome.remove {
            remove_bouncing_address(&self.site, &self.virgin, &mut list, addr)?;
        }
        for addr in &outcome.bounce {
            register_bounce(&self.site, &self.virgin, &mut list, addr)?;
        }
        store.save(&list)?;
        Ok(Disposition::Finish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::{ListStore, Member};
    use crate::pipeline::test_support::{Fixture, chain_fixture};

    fn dsn(body: &str) -> Message {
        Message::parse(
            format!(
                "From: MAILER-DAEMON@mail.example.net\n\
                 To: test-bounces@example.com\n\
                 Subject: Undelivered mail\n\
                 \n\
                 {body}"
            )
            .as_bytes(),
        )
        .expect("parse")
    }

    #[test]
    fn non_bounce_sender_is_gated() {
        let msg = Message::parse(
            b"From: human@example.net\n\n550 x@example.com... User unknown\n",
        )
        .expect("parse");
        assert!(scan_message(&msg).is_none());
    }

    #[test]
    fn code_550_extracts_and_removes() {
        let msg = dsn("550 x@example.com... User unknown\n");
        let outcome = scan_message(&msg).expect("scanned");
        assert_eq!(outcome.remove, vec!["x@example.com".to_string()]);
        assert!(outcome.bounce.is_empty());
    }

    #[test]
    fn code_451_is_a_soft_bounce() {
        let msg = dsn("smtp; 451 <y@example.com> greylisted, try again later\n");
        let outcome = scan_message(&msg).expect("scanned");
        assert!(outcome.remove.is_empty());
        assert_eq!(outcome.bounce, vec!["y@example.com".to_string()]);
    }

    #[test]
    fn angle_brackets_are_stripped() {
        let msg = dsn("550 <z@example.com>: user lookup failed\n");
        let outcome = scan_message(&msg).expect("scanned");
        assert_eq!(outcome.remove, vec!["z@example.com".to_string()]);
    }

    #[test]
    fn messy_patterns_join_with_remote_domain() {
        let msg = dsn("Recipient wanda is unknown here\n");
        let outcome = scan_message(&msg).expect("scanned");
        assert_eq!(outcome.bounce, vec!["wanda@mail.example.net".to_string()]);

        let msg = dsn("User victor is not defined in the alias map\n");
        let outcome = scan_message(&msg).expect("scanned");
        assert_eq!(outcome.remove, vec!["victor@mail.example.net".to_string()]);

        let msg = dsn("  ulysses: User unknown\n");
        let outcome = scan_message(&msg).expect("scanned");
        assert_eq!(outcome.remove, vec!["ulysses@mail.example.net".to_string()]);

        let msg = dsn("tina - User currently disabled\n");
        let outcome = scan_message(&msg).expect("scanned");
        assert_eq!(outcome.remove, vec!["tina@mail.example.net".to_string()]);
    }

    #[test]
    fn removals_are_deduplicated_per_scan() {
        let msg = dsn(
            "550 x@example.com... User unknown\n550 x@example.com... User unknown\n",
        );
        let outcome = scan_message(&msg).expect("scanned");
        assert_eq!(outcome.remove.len(), 1);
    }

    #[test]
    fn dsn_postamble_is_not_scanned() {
        // The echoed original below the marker must not trigger actions.
        let msg = dsn(
            "Delivery failed.\n\
             ------Your original message------\n\
             550 victim@example.com... User unknown\n",
        );
        let outcome = scan_message(&msg).expect("scanned");
        assert!(outcome.is_empty());
    }

    #[test]
    fn multipart_scans_first_part_only() {
        let raw = b"From: mailer-daemon@mx.example.net\n\
            Content-Type: multipart/report; boundary=\"XYZ\"\n\
            \n\
            --XYZ\n\
            Content-Type: text/plain\n\
            \n\
            550 gone@example.com... User unknown\n\
            --XYZ\n\
            Content-Type: text/plain\n\
            \n\
            550 other@example.com... User unknown\n\
            --XYZ--\n";
        let msg = Message::parse(raw).expect("parse");
        let outcome = scan_message(&msg).expect("scanned");
        assert_eq!(outcome.remove, vec!["gone@example.com".to_string()]);
    }

    // --- scoring ---------------------------------------------------------

    fn scored_list(fx: &Fixture) -> MailingList {
        let mut list = fx.list();
        list.roster.subscribe(Member::new("x@example.com", "pw"));
        list.bounce.minimum_removal_days = 5;
        list.bounce.minimum_post_count_before_removal = 10;
        list.bounce.max_posts_between_bounces = 5;
        list
    }

    #[test]
    fn first_bounce_creates_a_record() {
        let (_td, fx) = chain_fixture();
        let mut list = scored_list(&fx);
        list.bounce.post_id = 3;

        register_bounce(&fx.site, &fx.virgin, &mut list, "x@example.com").expect("register");
        let record = list.bounce.records.get("x@example.com").expect("record");
        assert_eq!(record.first_post_id, 3);
        assert_eq!(record.last_post_id, 3);
        assert!(list.roster.is_member("x@example.com"));
    }

    #[test]
    fn old_enough_record_with_enough_posts_removes() {
        let (_td, fx) = chain_fixture();
        let mut list = scored_list(&fx);
        list.bounce.post_id = 21;
        list.bounce.records.insert(
            "x@example.com".to_string(),
            BounceRecord {
                version: 1,
                first_seen: Utc::now() - chrono::Duration::days(10),
                first_post_id: 1,
                last_post_id: 18,
            },
        );

        register_bounce(&fx.site, &fx.virgin, &mut list, "x@example.com").expect("register");
        assert!(!list.roster.is_member("x@example.com"));
        assert!(!list.bounce.records.contains_key("x@example.com"));
    }

    #[test]
    fn recent_record_only_updates() {
        let (_td, fx) = chain_fixture();
        let mut list = scored_list(&fx);
        list.bounce.post_id = 4;
        list.bounce.records.insert(
            "x@example.com".to_string(),
            BounceRecord {
                version: 1,
                first_seen: Utc::now() - chrono::Duration::hours(2),
                first_post_id: 1,
                last_post_id: 2,
            },
        );

        register_bounce(&fx.site, &fx.virgin, &mut list, "x@example.com").expect("register");
        assert!(list.roster.is_member("x@example.com"));
        let record = list.bounce.records.get("x@example.com").expect("record");
        assert_eq!(record.last_post_id, 4);
        assert_eq!(record.first_post_id, 1);
    }

    #[test]
    fn stale_record_is_reset_not_scored() {
        let (_td, fx) = chain_fixture();
        let mut list = scored_list(&fx);
        list.bounce.post_id = 50;
        list.bounce.records.insert(
            "x@example.com".to_string(),
            BounceRecord {
                version: 1,
                first_seen: Utc::now() - chrono::Duration::days(30),
                first_post_id: 1,
                last_post_id: 2,
            },
        );

        register_bounce(&fx.site, &fx.virgin, &mut list, "x@example.com").expect("register");
        // Old enough and plenty of posts, but the 2→50 gap marks the
        // record stale, so it restarts instead of removing.
        assert!(list.roster.is_member("x@example.com"));
        let record = list.bounce.records.get("x@example.com").expect("record");
        assert_eq!(record.first_post_id, 50);
    }

    #[test]
    fn digest_member_is_clocked_by_volume() {
        let (_td, fx) = chain_fixture();
        let mut list = scored_list(&fx);
        let mut member = Member::new("d@example.com", "pw");
        member.digest = true;
        list.roster.subscribe(member);
        list.digest.volume = 3;
        list.bounce.records.insert(
            "d@example.com".to_string(),
            BounceRecord {
                version: 1,
                first_seen: Utc::now() - chrono::Duration::days(10),
                first_post_id: 3,
                last_post_id: 3,
            },
        );

        register_bounce(&fx.site, &fx.virgin, &mut list, "d@example.com").expect("register");
        assert!(!list.roster.is_member("d@example.com"));
    }

    #[test]
    fn nonmember_bounce_is_logged_only() {
        let (_td, fx) = chain_fixture();
        let mut list = scored_list(&fx);
        register_bounce(&fx.site, &fx.virgin, &mut list, "ghost@example.com")
            .expect("register");
        assert!(!list.bounce.records.contains_key("ghost@example.com"));
    }

    #[test]
    fn removal_notifies_owner() {
        let (_td, fx) = chain_fixture();
        let mut list = scored_list(&fx);
        remove_bouncing_address(&fx.site, &fx.virgin, &mut list, "x@example.com")
            .expect("remove");
        assert!(!list.roster.is_member("x@example.com"));

        let ids = fx.virgin.files().expect("files");
        assert_eq!(ids.len(), 1);
        let (bytes, _) = fx.virgin.dequeue(&ids[0]).expect("dequeue");
        let notice = Message::parse(&bytes).expect("parse");
        assert_eq!(notice.get("to"), Some("test-owner@example.com"));
    }

    #[test]
    fn scanner_end_to_end_removal() {
        let (_td, fx) = chain_fixture();
        let mut list = scored_list(&fx);
        list.bounce.post_id = 21;
        list.bounce.records.insert(
            "x@example.com".to_string(),
            BounceRecord {
                version: 1,
                first_seen: Utc::now() - chrono::Duration::days(10),
                first_post_id: 1,
                last_post_id: 18,
            },
        );
        fx.site.list_store().save(&list).expect("save");

        let mut scanner = BounceScanner::new(fx.site.clone()).expect("scanner");
        let msg = dsn("550 x@example.com... User unknown\n");
        let mut meta = Metadata::new();
        meta.set_listname("test@example.com");
        let disposition = scanner.dispose(msg, meta).expect("dispose");
        assert_eq!(disposition, Disposition::Finish);

        let reloaded = fx.site.list_store().load("test@example.com").expect("load");
        assert!(!reloaded.roster.is_member("x@example.com"));
        assert!(!reloaded.bounce.records.contains_key("x@example.com"));
    }
}
