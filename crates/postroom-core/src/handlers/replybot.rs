//! Canned autoresponses for -request traffic, capped per sender per day.

use anyhow::Result;
use chrono::Utc;
use postroom_message::Message;
use postroom_switchboard::{Metadata, Switchboard};
use postroom_types::Channel;

use crate::Site;
use crate::list::{AutoResponse, MailingList};
use crate::notify::{enqueue_virgin, user_notification};
use crate::pipeline::{Handler, HandlerContext, PipelineError, Verdict};

/// Send the canned -request autoresponse if the list is configured for
/// one and the sender has not hit the daily cap. Returns whether a
/// response went out.
pub fn autorespond_request(
    site: &Site,
    virgin: &Switchboard,
    list: &mut MailingList,
    msg: &Message,
) -> Result<bool> {
    if list.autorespond_requests == AutoResponse::None {
        return Ok(false);
    }
    let Some(sender) = msg.sender() else {
        return Ok(false);
    };
    let max = site.config().max_autoresponses_per_day();
    if !list
        .autoresponses
        .allow(&sender, Utc::now().date_naive(), max)
    {
        site.logger().log(
            Channel::Vette,
            Some(&list.name),
            format!("autoresponse cap reached for {sender}"),
        );
        return Ok(false);
    }

    let body = list.autoresponse_text.clone().unwrap_or_else(|| {
        format!(
            "Your message to {} has been received. Commands are processed\n\
             automatically; send a message with 'help' in the subject or body\n\
             for instructions.\n",
            list.request_address()
        )
    });
    let reply = user_notification(
        list,
        &sender,
        &format!("Auto-response for your message to {}", list.request_address()),
        &body,
    );
    enqueue_virgin(virgin, list, &reply, &[sender])?;
    Ok(true)
}

pub struct Replybot;

impl Handler for Replybot {
    fn name(&self) -> &'static str {
        "replybot"
    }

    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        list: &mut MailingList,
        msg: &mut Message,
        meta: &mut Metadata,
    ) -> Result<Verdict, PipelineError> {
        // Only -request traffic is autoresponded here; ordinary postings
        // fall straight through.
        if !meta.get_bool("torequest") {
            return Ok(Verdict::Continue);
        }
        autorespond_request(ctx.site, ctx.virgin, list, msg)?;
        if list.autorespond_requests == AutoResponse::RespondAndDiscard {
            return Ok(Verdict::Stop);
        }
        Ok(Verdict::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::chain_fixture;

    fn request_msg() -> Message {
        Message::parse(b"From: anne@example.com\nSubject: help\n\nhelp\n").expect("parse")
    }

    #[test]
    fn no_autoresponse_configured_means_no_mail() {
        let (_td, fx) = chain_fixture();
        let mut list = fx.list();
        let responded =
            autorespond_request(&fx.site, &fx.virgin, &mut list, &request_msg()).expect("run");
        assert!(!responded);
        assert!(fx.virgin.files().expect("files").is_empty());
    }

    #[test]
    fn respond_and_discard_stops_the_chain() {
        let (_td, fx) = chain_fixture();
        let mut list = fx.list();
        list.autorespond_requests = AutoResponse::RespondAndDiscard;
        let mut msg = request_msg();
        let mut meta = Metadata::new();
        meta.set_bool("torequest", true);

        let verdict = Replybot
            .handle(&fx.ctx(), &mut list, &mut msg, &mut meta)
            .expect("handle");
        assert_eq!(verdict, Verdict::Stop);
        assert_eq!(fx.virgin.files().expect("files").len(), 1);
    }

    #[test]
    fn ordinary_posting_passes_untouched() {
        let (_td, fx) = chain_fixture();
        let mut list = fx.list();
        list.autorespond_requests = AutoResponse::RespondAndDiscard;
        let mut msg = request_msg();
        let mut meta = Metadata::new();

        let verdict = Replybot
            .handle(&fx.ctx(), &mut list, &mut msg, &mut meta)
            .expect("handle");
        assert_eq!(verdict, Verdict::Continue);
        assert!(fx.virgin.files().expect("files").is_empty());
    }

    #[test]
    fn daily_cap_silences_the_bot() {
        let (_td, fx) = chain_fixture();
        let mut list = fx.list();
        list.autorespond_requests = AutoResponse::RespondAndContinue;
        let msg = request_msg();

        // Default cap is 10 per day.
        for _ in 0..10 {
            assert!(
                autorespond_request(&fx.site, &fx.virgin, &mut list, &msg).expect("run")
            );
        }
        assert!(!autorespond_request(&fx.site, &fx.virgin, &mut list, &msg).expect("run"));
        assert_eq!(fx.virgin.files().expect("files").len(), 10);
    }
}
