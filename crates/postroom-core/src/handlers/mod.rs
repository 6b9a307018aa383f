//! The incoming pipeline handlers, in their canonical order.

mod approve;
mod cleanse;
mod cook_headers;
mod decorate;
mod hold;
mod moderate;
mod replybot;
mod scrub;
mod to_archive;
mod to_digest;
mod to_outgoing;

pub use approve::Approve;
pub use cleanse::CleanseHeaders;
pub use cook_headers::CookHeaders;
pub use decorate::{Decorate, decorate_template};
pub use hold::SpamAndSizeFilter;
pub use moderate::Moderate;
pub use replybot::{Replybot, autorespond_request};
pub use scrub::MimeScrub;
pub use to_archive::ToArchive;
pub use to_digest::ToDigest;
pub use to_outgoing::ToOutgoing;

use crate::pipeline::Handler;

/// The canonical delivery pipeline.
pub fn default_chain() -> Vec<Box<dyn Handler>> {
    vec![
        Box::new(SpamAndSizeFilter),
        Box::new(Approve),
        Box::new(Replybot),
        Box::new(Moderate),
        Box::new(CookHeaders),
        Box::new(CleanseHeaders),
        Box::new(MimeScrub),
        Box::new(Decorate),
        Box::new(ToDigest),
        Box::new(ToOutgoing),
        Box::new(ToArchive),
    ]
}
