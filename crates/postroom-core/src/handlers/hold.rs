//! Spam and size gate: oversize or disallowed-content-type postings are
//! held for moderator review before anything else looks at them.

use postroom_message::Message;
use postroom_switchboard::Metadata;

use crate::list::MailingList;
use crate::pipeline::{Handler, HandlerContext, PipelineError, Verdict};

pub struct SpamAndSizeFilter;

impl Handler for SpamAndSizeFilter {
    fn name(&self) -> &'static str {
        "spam-filter"
    }

    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        list: &mut MailingList,
        msg: &mut Message,
        meta: &mut Metadata,
    ) -> Result<Verdict, PipelineError> {
        let limit_kib = list.moderation.max_message_size_kib;
        if limit_kib > 0 {
            let size = meta
                .get_i64("original_size")
                .map(|s| s.max(0) as u64)
                .unwrap_or_else(|| msg.to_bytes().len() as u64);
            if size > limit_kib * 1024 {
                return Err(PipelineError::Hold(format!(
                    "Message body is too big: {size} bytes with a limit of {limit_kib} KB"
                )));
            }
        }

        let (ctype, subtype) = msg.content_type();
        let full = format!("{ctype}/{subtype}");
        if list.moderation.forbidden_content_types.contains(&full)
            || list.moderation.forbidden_content_types.contains(&ctype)
        {
            return Err(PipelineError::Hold(format!(
                "Message has a disallowed content type: {full}"
            )));
        }

        Ok(Verdict::Continue)
    }
}
