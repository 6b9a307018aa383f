//! Fan out to the outgoing queue with the computed recipient set, and
//! advance the list's posting counter.

use postroom_message::Message;
use postroom_switchboard::Metadata;
use postroom_types::Channel;

use crate::list::MailingList;
use crate::pipeline::{Handler, HandlerContext, PipelineError, Verdict};

pub struct ToOutgoing;

impl Handler for ToOutgoing {
    fn name(&self) -> &'static str {
        "to-outgoing"
    }

    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        list: &mut MailingList,
        msg: &mut Message,
        meta: &mut Metadata,
    ) -> Result<Verdict, PipelineError> {
        // Explicit recipients from injection win; otherwise the roster
        // minus digest-only minus disabled members.
        let recipients = meta
            .recipients()
            .unwrap_or_else(|| list.roster.regular_delivery_addresses());

        let mut out_meta = meta.clone();
        out_meta.set_listname(&list.name);
        out_meta.set_recipients(&recipients);
        ctx.out
            .enqueue(&msg.to_bytes(), &out_meta)
            .map_err(|err| PipelineError::Fault(err.into()))?;

        // The posting counter clocks bounce scoring.
        list.bounce.post_id += 1;
        ctx.site.logger().log(
            Channel::Post,
            Some(&list.name),
            format!(
                "post {} fanned out to {} recipients",
                list.bounce.post_id,
                recipients.len()
            ),
        );

        Ok(Verdict::Continue)
    }
}
