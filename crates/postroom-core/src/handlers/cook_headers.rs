//! Header cooking: List-* headers, Reply-To policy, and the subject
//! prefix.

use postroom_message::Message;
use postroom_switchboard::Metadata;

use crate::list::MailingList;
use crate::pipeline::{Handler, HandlerContext, PipelineError, Verdict};

pub struct CookHeaders;

impl Handler for CookHeaders {
    fn name(&self) -> &'static str {
        "cook-headers"
    }

    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        list: &mut MailingList,
        msg: &mut Message,
        _meta: &mut Metadata,
    ) -> Result<Verdict, PipelineError> {
        // Subject prefix, tolerant of Re: variants and an existing prefix.
        let prefix = list.subject_prefix.clone();
        if !prefix.is_empty() {
            let subject = msg.subject().unwrap_or("").trim().to_string();
            if subject.is_empty() {
                let catalog = crate::i18n::Catalog::new(list.preferred_language);
                msg.set("Subject", format!("{prefix}{}", catalog.no_subject()));
            } else if !has_prefix(&subject, &prefix) {
                msg.set("Subject", format!("{prefix}{subject}"));
            }
        }

        if list.reply_goes_to_list {
            msg.set("Reply-To", list.posting_address());
        }

        let local = list.list_name().to_string();
        let domain = list.host_name().to_string();
        msg.set("List-Id", format!("<{local}.{domain}>"));
        msg.set(
            "List-Help",
            format!("<mailto:{}?subject=help>", list.request_address()),
        );
        msg.set("List-Post", format!("<mailto:{}>", list.posting_address()));
        msg.set(
            "List-Subscribe",
            format!("<mailto:{local}-join@{domain}>"),
        );
        msg.set(
            "List-Unsubscribe",
            format!("<mailto:{local}-leave@{domain}>"),
        );
        msg.ensure("Precedence", "list");
        msg.set("X-BeenThere", list.posting_address());

        Ok(Verdict::Continue)
    }
}

/// True when `subject`, ignoring case and any leading `Re:` variants,
/// already starts with the list prefix.
fn has_prefix(subject: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end().to_ascii_lowercase();
    if prefix.is_empty() {
        return true;
    }
    let mut rest = subject.trim_start().to_ascii_lowercase();
    loop {
        if rest.starts_with(&prefix) {
            return true;
        }
        // Strip one leading "re:" / "re :"-less variant and retry.
        if let Some(stripped) = rest.strip_prefix("re:") {
            rest = stripped.trim_start().to_string();
        } else if let Some(stripped) = rest.strip_prefix("re ") {
            rest = stripped.trim_start().to_string();
        } else {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::chain_fixture;

    fn cooked(list: &mut MailingList, raw: &[u8]) -> Message {
        let (_td, fx) = chain_fixture();
        let mut msg = Message::parse(raw).expect("parse");
        CookHeaders
            .handle(&fx.ctx(), list, &mut msg, &mut Metadata::new())
            .expect("handle");
        msg
    }

    #[test]
    fn subject_prefix_is_prepended() {
        let mut list = MailingList::new("test@example.com", "Test").expect("list");
        let msg = cooked(&mut list, b"From: a@example.com\nSubject: hello\n\nbody\n");
        assert_eq!(msg.subject(), Some("[Test] hello"));
    }

    #[test]
    fn existing_prefix_is_not_duplicated() {
        let mut list = MailingList::new("test@example.com", "Test").expect("list");
        let msg = cooked(
            &mut list,
            b"From: a@example.com\nSubject: [Test] hello\n\nbody\n",
        );
        assert_eq!(msg.subject(), Some("[Test] hello"));
    }

    #[test]
    fn re_variants_are_tolerated() {
        let mut list = MailingList::new("test@example.com", "Test").expect("list");
        for subject in ["Re: [Test] hello", "RE: [test] hello", "re: re: [TEST] hello"] {
            let raw = format!("From: a@example.com\nSubject: {subject}\n\nbody\n");
            let msg = cooked(&mut list, raw.as_bytes());
            assert_eq!(msg.subject(), Some(subject), "subject {subject:?} rewritten");
        }
    }

    #[test]
    fn missing_subject_gets_prefixed_placeholder() {
        let mut list = MailingList::new("test@example.com", "Test").expect("list");
        let msg = cooked(&mut list, b"From: a@example.com\n\nbody\n");
        assert_eq!(msg.subject(), Some("[Test] (no subject)"));
    }

    #[test]
    fn list_headers_are_injected() {
        let mut list = MailingList::new("test@example.com", "Test").expect("list");
        let msg = cooked(&mut list, b"From: a@example.com\nSubject: x\n\nbody\n");
        assert_eq!(msg.get("list-id"), Some("<test.example.com>"));
        assert_eq!(
            msg.get("list-post"),
            Some("<mailto:test@example.com>")
        );
        assert_eq!(
            msg.get("list-help"),
            Some("<mailto:test-request@example.com?subject=help>")
        );
        assert_eq!(
            msg.get("list-subscribe"),
            Some("<mailto:test-join@example.com>")
        );
        assert_eq!(
            msg.get("list-unsubscribe"),
            Some("<mailto:test-leave@example.com>")
        );
        assert_eq!(msg.get("precedence"), Some("list"));
        assert_eq!(msg.get("x-beenthere"), Some("test@example.com"));
    }

    #[test]
    fn reply_to_policy() {
        let mut list = MailingList::new("test@example.com", "Test").expect("list");
        list.reply_goes_to_list = true;
        let msg = cooked(
            &mut list,
            b"From: a@example.com\nReply-To: a@example.com\nSubject: x\n\nbody\n",
        );
        assert_eq!(msg.get("reply-to"), Some("test@example.com"));
    }

    #[test]
    fn existing_precedence_is_preserved() {
        let mut list = MailingList::new("test@example.com", "Test").expect("list");
        let msg = cooked(
            &mut list,
            b"From: a@example.com\nPrecedence: first-class\nSubject: x\n\nbody\n",
        );
        assert_eq!(msg.get("precedence"), Some("first-class"));
    }
}
