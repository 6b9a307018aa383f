//! Sender moderation gate: members versus non-members, with the
//! configured action for each.

use postroom_message::Message;
use postroom_switchboard::Metadata;

use crate::list::{MailingList, SenderAction};
use crate::pipeline::{Handler, HandlerContext, PipelineError, Verdict};

pub struct Moderate;

impl Handler for Moderate {
    fn name(&self) -> &'static str {
        "moderate"
    }

    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        list: &mut MailingList,
        msg: &mut Message,
        meta: &mut Metadata,
    ) -> Result<Verdict, PipelineError> {
        if meta.get_bool("approved") {
            return Ok(Verdict::Continue);
        }

        let Some(sender) = msg.sender() else {
            return Err(PipelineError::Hold(
                "Posting has no discernible sender address".to_string(),
            ));
        };

        if let Some(member) = list.roster.get(&sender) {
            if member.moderated || list.moderation.member_posts_moderated {
                return Err(PipelineError::Hold(format!(
                    "Post by moderated member {sender}"
                )));
            }
            return Ok(Verdict::Continue);
        }

        if list.moderation.accept_these_nonmembers.contains(&sender) {
            return Ok(Verdict::Continue);
        }

        match list.moderation.nonmember_action {
            SenderAction::Accept => Ok(Verdict::Continue),
            SenderAction::Hold => Err(PipelineError::Hold(format!(
                "Post by non-member {sender} to a members-only list"
            ))),
            SenderAction::Reject => Err(PipelineError::Reject(
                "You are not allowed to post to this mailing list, and your \
                 message has been automatically rejected."
                    .to_string(),
            )),
            SenderAction::Discard => Err(PipelineError::Discard),
        }
    }
}
