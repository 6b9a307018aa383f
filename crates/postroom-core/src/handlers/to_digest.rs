//! Digest accumulation: append each delivered message to the list's
//! `digest.mbox` and trigger assembly at the size threshold.

use anyhow::Context;
use postroom_message::{Message, append_message};
use postroom_switchboard::Metadata;
use postroom_types::Channel;

use crate::digest::send_digests;
use crate::list::{MailingList, digest_mbox_path};
use crate::pipeline::{Handler, HandlerContext, PipelineError, Verdict};

pub struct ToDigest;

impl Handler for ToDigest {
    fn name(&self) -> &'static str {
        "to-digest"
    }

    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        list: &mut MailingList,
        msg: &mut Message,
        meta: &mut Metadata,
    ) -> Result<Verdict, PipelineError> {
        // Digests of digests would recurse forever.
        if !list.digest.digestable || meta.get_bool("isdigest") {
            return Ok(Verdict::Continue);
        }

        let list_dir = ctx.site.list_store().list_dir(&list.name);
        std::fs::create_dir_all(&list_dir)
            .with_context(|| format!("failed to create list dir {}", list_dir.display()))
            .map_err(PipelineError::Fault)?;
        let mbox = digest_mbox_path(&list_dir);

        let envelope = msg.sender().unwrap_or_else(|| list.bounces_address());
        append_message(&mbox, &envelope, &msg.to_bytes()).map_err(PipelineError::Fault)?;

        let size = std::fs::metadata(&mbox)
            .with_context(|| format!("failed to stat {}", mbox.display()))
            .map_err(PipelineError::Fault)?
            .len();

        if size as f64 / 1024.0 >= f64::from(list.digest.size_threshold_kib) {
            let bytes = std::fs::read(&mbox)
                .with_context(|| format!("failed to read {}", mbox.display()))
                .map_err(PipelineError::Fault)?;
            // Any assembly failure leaves the mbox in place so the next
            // accumulation can retry.
            send_digests(ctx.site, ctx.virgin, list, &bytes).map_err(PipelineError::Fault)?;
            std::fs::remove_file(&mbox)
                .with_context(|| format!("failed to unlink {}", mbox.display()))
                .map_err(PipelineError::Fault)?;
            ctx.site.logger().log(
                Channel::Digest,
                Some(&list.name),
                format!("digest assembled at {size} bytes"),
            );
        }

        Ok(Verdict::Continue)
    }
}
