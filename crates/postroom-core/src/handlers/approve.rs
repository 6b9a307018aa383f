//! Administrator pre-approval: an `Approved:` header carrying the
//! moderator password lets a posting bypass moderation. The header is
//! always stripped so the password never leaks downstream.

use postroom_message::Message;
use postroom_switchboard::Metadata;

use crate::list::MailingList;
use crate::pipeline::{Handler, HandlerContext, PipelineError, Verdict};

const APPROVAL_HEADERS: [&str; 3] = ["approved", "approve", "x-approved"];

pub struct Approve;

impl Handler for Approve {
    fn name(&self) -> &'static str {
        "approve"
    }

    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        list: &mut MailingList,
        msg: &mut Message,
        meta: &mut Metadata,
    ) -> Result<Verdict, PipelineError> {
        for header in APPROVAL_HEADERS {
            if let Some(candidate) = msg.get(header)
                && list.check_moderator_password(candidate.trim())
            {
                meta.set_bool("approved", true);
            }
        }
        for header in APPROVAL_HEADERS {
            msg.remove(header);
        }
        Ok(Verdict::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::password_digest;
    use crate::pipeline::test_support::chain_fixture;

    #[test]
    fn correct_password_approves_and_strips() {
        let (_td, fx) = chain_fixture();
        let mut list = fx.list();
        list.moderation.moderator_password = Some(password_digest("sekrit"));
        let mut msg =
            Message::parse(b"From: a@example.com\nApproved: sekrit\n\nbody\n").expect("parse");
        let mut meta = Metadata::new();

        Approve
            .handle(&fx.ctx(), &mut list, &mut msg, &mut meta)
            .expect("handle");
        assert!(meta.get_bool("approved"));
        assert!(!msg.has("approved"));
    }

    #[test]
    fn wrong_password_strips_without_approving() {
        let (_td, fx) = chain_fixture();
        let mut list = fx.list();
        list.moderation.moderator_password = Some(password_digest("sekrit"));
        let mut msg =
            Message::parse(b"From: a@example.com\nApproved: nope\n\nbody\n").expect("parse");
        let mut meta = Metadata::new();

        Approve
            .handle(&fx.ctx(), &mut list, &mut msg, &mut meta)
            .expect("handle");
        assert!(!meta.get_bool("approved"));
        assert!(!msg.has("approved"));
    }

    #[test]
    fn no_moderator_password_never_approves() {
        let (_td, fx) = chain_fixture();
        let mut list = fx.list();
        let mut msg =
            Message::parse(b"From: a@example.com\nApprove: anything\n\nbody\n").expect("parse");
        let mut meta = Metadata::new();

        Approve
            .handle(&fx.ctx(), &mut list, &mut msg, &mut meta)
            .expect("handle");
        assert!(!meta.get_bool("approved"));
        assert!(!msg.has("approve"));
    }
}
