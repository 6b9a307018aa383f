//! MIME scrubbing: on lists that filter HTML, text/html parts are
//! stripped from multiparts and a bare HTML body is converted to plain
//! text. A message scrubbed down to nothing is discarded.

use postroom_message::{Body, Message};
use postroom_switchboard::Metadata;

use crate::list::MailingList;
use crate::pipeline::{Handler, HandlerContext, PipelineError, Verdict};

pub struct MimeScrub;

impl Handler for MimeScrub {
    fn name(&self) -> &'static str {
        "mime-scrub"
    }

    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        list: &mut MailingList,
        msg: &mut Message,
        _meta: &mut Metadata,
    ) -> Result<Verdict, PipelineError> {
        if !list.filter_html {
            return Ok(Verdict::Continue);
        }
        if !scrub(msg) {
            return Err(PipelineError::Discard);
        }
        Ok(Verdict::Continue)
    }
}

/// Scrub one message (or part) in place. Returns false when nothing
/// deliverable remains.
fn scrub(msg: &mut Message) -> bool {
    let (ctype, subtype) = msg.content_type();

    if msg.is_multipart() {
        let Body::Multipart(mut mp) =
            std::mem::replace(msg.body_mut(), Body::Text(String::new()))
        else {
            return false;
        };
        mp.parts.retain_mut(scrub);
        if mp.parts.is_empty() {
            return false;
        }
        // A filtered multipart/alternative with one remaining part is no
        // longer an alternative set; hoist the survivor.
        if mp.subtype == "alternative" && mp.parts.len() == 1 {
            let survivor = mp.parts.remove(0);
            for name in ["content-type", "content-transfer-encoding", "content-disposition"] {
                msg.remove(name);
                if let Some(value) = survivor.get(name) {
                    msg.append(name, value.to_string());
                }
            }
            msg.set_body(survivor.body().clone());
        } else {
            msg.set_body(Body::Multipart(mp));
        }
        return true;
    }

    if ctype == "text" && subtype == "html" {
        if let Body::Text(text) = msg.body_mut() {
            let plain = strip_html(text);
            if plain.trim().is_empty() {
                return false;
            }
            *text = plain;
        }
        msg.set("Content-Type", "text/plain; charset=\"utf-8\"");
    }
    true
}

/// Minimal tag stripper for converted HTML bodies.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&nbsp;", " ")
}
