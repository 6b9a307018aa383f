//! The handler pipeline contract.
//!
//! Each handler sees the same `(list, message, metadata)` triple and may
//! mutate any of them. Early exit is expressed in the type system rather
//! than control-flow exceptions: a handler returns [`Verdict::Stop`] to
//! end the chain cleanly, or one of the [`PipelineError`] variants to
//! discard, reject, or hold the message.

use postroom_message::Message;
use postroom_switchboard::Switchboard;

use crate::Site;
use crate::list::MailingList;

/// Normal handler outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Proceed to the next handler.
    Continue,
    /// End the pipeline without error.
    Stop,
}

/// Early-exit and failure outcomes.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Drop the message silently.
    #[error("message discarded")]
    Discard,
    /// Bounce the message back to the sender with a reason.
    #[error("message rejected: {0}")]
    Reject(String),
    /// Park the message for moderator review.
    #[error("message held: {0}")]
    Hold(String),
    /// Retry the whole entry later (lock timeout, temporary I/O failure).
    #[error("transient failure: {0}")]
    Transient(String),
    /// Unexpected failure; the entry will be shunted.
    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

/// Resources a handler may reach beyond the triple itself.
pub struct HandlerContext<'a> {
    pub site: &'a Site,
    pub virgin: &'a Switchboard,
    pub out: &'a Switchboard,
    pub archive: &'a Switchboard,
}

/// One stage of the incoming pipeline.
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        list: &mut MailingList,
        msg: &mut Message,
        meta: &mut postroom_switchboard::Metadata,
    ) -> Result<Verdict, PipelineError>;
}

/// Run the chain to completion or early exit.
pub fn run_chain(
    handlers: &[Box<dyn Handler>],
    ctx: &HandlerContext<'_>,
    list: &mut MailingList,
    msg: &mut Message,
    meta: &mut postroom_switchboard::Metadata,
) -> Result<(), PipelineError> {
    for handler in handlers {
        match handler.handle(ctx, list, msg, meta)? {
            Verdict::Continue => {}
            Verdict::Stop => break,
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::chain_fixture;
    use super::*;
    use postroom_switchboard::Metadata;

    struct Tag(&'static str, Verdict);

    impl Handler for Tag {
        fn name(&self) -> &'static str {
            self.0
        }

        fn handle(
            &self,
            _ctx: &HandlerContext<'_>,
            _list: &mut MailingList,
            msg: &mut Message,
            _meta: &mut Metadata,
        ) -> Result<Verdict, PipelineError> {
            msg.append("X-Visited", self.0);
            Ok(self.1)
        }
    }

    struct Holds;

    impl Handler for Holds {
        fn name(&self) -> &'static str {
            "holds"
        }

        fn handle(
            &self,
            _ctx: &HandlerContext<'_>,
            _list: &mut MailingList,
            _msg: &mut Message,
            _meta: &mut Metadata,
        ) -> Result<Verdict, PipelineError> {
            Err(PipelineError::Hold("test reason".to_string()))
        }
    }

    #[test]
    fn chain_runs_in_order_and_stops() {
        let (_td, fx) = chain_fixture();
        let mut list = fx.list();
        let mut msg = Message::parse(b"From: a@example.com\n\nbody\n").expect("parse");
        let mut meta = Metadata::new();

        let handlers: Vec<Box<dyn Handler>> = vec![
            Box::new(Tag("one", Verdict::Continue)),
            Box::new(Tag("two", Verdict::Stop)),
            Box::new(Tag("three", Verdict::Continue)),
        ];
        run_chain(&handlers, &fx.ctx(), &mut list, &mut msg, &mut meta).expect("run");
        assert_eq!(msg.get_all("x-visited"), vec!["one", "two"]);
    }

    #[test]
    fn hold_propagates_without_running_later_handlers() {
        let (_td, fx) = chain_fixture();
        let mut list = fx.list();
        let mut msg = Message::parse(b"From: a@example.com\n\nbody\n").expect("parse");
        let mut meta = Metadata::new();

        let handlers: Vec<Box<dyn Handler>> = vec![
            Box::new(Holds),
            Box::new(Tag("after", Verdict::Continue)),
        ];
        let err = run_chain(&handlers, &fx.ctx(), &mut list, &mut msg, &mut meta)
            .expect_err("must hold");
        assert!(matches!(err, PipelineError::Hold(reason) if reason == "test reason"));
        assert!(!msg.has("x-visited"));
    }
}
