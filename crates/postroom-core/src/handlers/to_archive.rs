//! Hand a copy of each accepted posting to the archive queue; the
//! archiver itself is an external consumer of that spool.

use postroom_message::Message;
use postroom_switchboard::Metadata;

use crate::list::MailingList;
use crate::pipeline::{Handler, HandlerContext, PipelineError, Verdict};

pub struct ToArchive;

impl Handler for ToArchive {
    fn name(&self) -> &'static str {
        "to-archive"
    }

    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        list: &mut MailingList,
        msg: &mut Message,
        meta: &mut Metadata,
    ) -> Result<Verdict, PipelineError> {
        if meta.get_bool("noarchive") {
            return Ok(Verdict::Continue);
        }
        let mut archive_meta = meta.clone();
        archive_meta.set_listname(&list.name);
        ctx.archive
            .enqueue(&msg.to_bytes(), &archive_meta)
            .map_err(|err| PipelineError::Fault(err.into()))?;
        Ok(Verdict::Continue)
    }
}
