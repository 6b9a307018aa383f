//! Header hygiene: strip approval headers, receipt requests, and other
//! headers that must not escape to subscribers. Message-ID is preserved.

use postroom_message::Message;
use postroom_switchboard::Metadata;

use crate::list::MailingList;
use crate::pipeline::{Handler, HandlerContext, PipelineError, Verdict};

const STRIPPED: [&str; 8] = [
    "approved",
    "approve",
    "x-approved",
    "urgent",
    "x-confirm-reading-to",
    "x-pmrqc",
    "return-receipt-to",
    "disposition-notification-to",
];

pub struct CleanseHeaders;

impl Handler for CleanseHeaders {
    fn name(&self) -> &'static str {
        "cleanse"
    }

    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        _list: &mut MailingList,
        msg: &mut Message,
        _meta: &mut Metadata,
    ) -> Result<Verdict, PipelineError> {
        for header in STRIPPED {
            msg.remove(header);
        }
        Ok(Verdict::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::chain_fixture;

    #[test]
    fn sensitive_headers_are_stripped_message_id_kept() {
        let (_td, fx) = chain_fixture();
        let mut list = fx.list();
        let mut msg = Message::parse(
            b"From: a@example.com\n\
              Message-ID: <keep-me>\n\
              Approved: password\n\
              Urgent: moderator-pw\n\
              Return-Receipt-To: a@example.com\n\
              Disposition-Notification-To: a@example.com\n\
              X-Confirm-Reading-To: a@example.com\n\
              Subject: x\n\
              \n\
              body\n",
        )
        .expect("parse");

        CleanseHeaders
            .handle(&fx.ctx(), &mut list, &mut msg, &mut Metadata::new())
            .expect("handle");

        for header in STRIPPED {
            assert!(!msg.has(header), "{header} must be stripped");
        }
        assert_eq!(msg.get("message-id"), Some("<keep-me>"));
        assert_eq!(msg.subject(), Some("x"));
    }
}
