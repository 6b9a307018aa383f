//! Decoration: render the list's header/footer templates around each
//! delivered message. Plain-text bodies are edited in place; anything
//! else grows MIME parts.

use postroom_message::{Body, Message, Multipart};
use postroom_switchboard::Metadata;

use crate::i18n::interpolate;
use crate::list::MailingList;
use crate::pipeline::{Handler, HandlerContext, PipelineError, Verdict};

pub struct Decorate;

impl Handler for Decorate {
    fn name(&self) -> &'static str {
        "decorate"
    }

    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        list: &mut MailingList,
        msg: &mut Message,
        _meta: &mut Metadata,
    ) -> Result<Verdict, PipelineError> {
        if list.msg_header.is_none() && list.msg_footer.is_none() {
            return Ok(Verdict::Continue);
        }
        let header = list.msg_header.as_deref().map(|t| decorate_template(list, t));
        let footer = list.msg_footer.as_deref().map(|t| decorate_template(list, t));

        let (ctype, subtype) = msg.content_type();
        if ctype == "text" && subtype == "plain" && matches!(msg.body(), Body::Text(_)) {
            if let Body::Text(text) = msg.body_mut() {
                let mut decorated = String::new();
                if let Some(header) = &header {
                    decorated.push_str(header);
                    decorated.push('\n');
                }
                decorated.push_str(text);
                if let Some(footer) = &footer {
                    if !decorated.ends_with('\n') {
                        decorated.push('\n');
                    }
                    decorated.push_str(footer);
                    decorated.push('\n');
                }
                *text = decorated;
            }
            return Ok(Verdict::Continue);
        }

        let charset = list.preferred_language.charset();
        if let Body::Multipart(mp) = msg.body_mut()
            && mp.subtype == "mixed"
        {
            if let Some(header) = header {
                mp.parts.insert(0, Message::text_plain(header, charset));
            }
            if let Some(footer) = footer {
                mp.parts.push(Message::text_plain(footer, charset));
            }
            return Ok(Verdict::Continue);
        }

        // Anything else gets wrapped in a fresh multipart/mixed with the
        // original payload carried as the middle part.
        let mut inner = Message::new();
        for name in [
            "content-type",
            "content-transfer-encoding",
            "content-disposition",
            "content-description",
        ] {
            if let Some(value) = msg.get(name) {
                inner.append(name, value.to_string());
            }
            msg.remove(name);
        }
        inner.set_body(std::mem::replace(msg.body_mut(), Body::Text(String::new())));

        let mut parts = Vec::new();
        if let Some(header) = header {
            parts.push(Message::text_plain(header, charset));
        }
        parts.push(inner);
        if let Some(footer) = footer {
            parts.push(Message::text_plain(footer, charset));
        }
        msg.set_body(Body::Multipart(Multipart {
            subtype: "mixed".to_string(),
            preamble: None,
            parts,
            postamble: None,
        }));
        msg.ensure("MIME-Version", "1.0");

        Ok(Verdict::Continue)
    }
}

/// Interpolate the list's template placeholders.
pub fn decorate_template(list: &MailingList, template: &str) -> String {
    interpolate(
        template,
        &[
            ("real_name", &list.real_name),
            ("list_name", list.list_name()),
            ("host_name", list.host_name()),
            ("description", &list.description),
            ("got_list_email", list.posting_address()),
            ("got_request_email", &list.request_address()),
            ("got_owner_email", &list.owner_address()),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::chain_fixture;

    fn decorated_list() -> MailingList {
        let mut list = MailingList::new("test@example.com", "Test").expect("list");
        list.msg_header = Some("%(real_name)s mailing list".to_string());
        list.msg_footer = Some("To leave, mail %(got_request_email)s".to_string());
        list
    }

    #[test]
    fn plain_text_body_is_edited_in_place() {
        let (_td, fx) = chain_fixture();
        let mut list = decorated_list();
        let mut msg =
            Message::parse(b"From: a@example.com\nSubject: x\n\nthe body\n").expect("parse");

        Decorate
            .handle(&fx.ctx(), &mut list, &mut msg, &mut Metadata::new())
            .expect("handle");

        let text = msg.first_text_plain().expect("text");
        assert!(text.starts_with("Test mailing list\n"));
        assert!(text.contains("the body"));
        assert!(text.ends_with("To leave, mail test-request@example.com\n"));
    }

    #[test]
    fn multipart_mixed_gains_parts() {
        let (_td, fx) = chain_fixture();
        let mut list = decorated_list();
        let mut msg = Message::multipart("mixed");
        msg.append("From", "a@example.com");
        msg.attach(Message::text_plain("original\n", "utf-8"))
            .expect("attach");

        Decorate
            .handle(&fx.ctx(), &mut list, &mut msg, &mut Metadata::new())
            .expect("handle");

        match msg.body() {
            Body::Multipart(mp) => {
                assert_eq!(mp.parts.len(), 3);
                assert!(
                    mp.parts[0]
                        .first_text_plain()
                        .expect("header part")
                        .contains("Test mailing list")
                );
                assert!(
                    mp.parts[2]
                        .first_text_plain()
                        .expect("footer part")
                        .contains("test-request@example.com")
                );
            }
            other => panic!("expected multipart, got {other:?}"),
        }
    }

    #[test]
    fn html_body_gets_wrapped() {
        let (_td, fx) = chain_fixture();
        let mut list = decorated_list();
        let mut msg = Message::parse(
            b"From: a@example.com\nContent-Type: text/html\n\n<p>hi</p>\n",
        )
        .expect("parse");

        Decorate
            .handle(&fx.ctx(), &mut list, &mut msg, &mut Metadata::new())
            .expect("handle");

        match msg.body() {
            Body::Multipart(mp) => {
                assert_eq!(mp.subtype, "mixed");
                assert_eq!(mp.parts.len(), 3);
                // The original payload kept its content type.
                assert_eq!(mp.parts[1].content_type().1, "html");
            }
            other => panic!("expected multipart, got {other:?}"),
        }
    }

    #[test]
    fn header_only_decoration() {
        let (_td, fx) = chain_fixture();
        let mut list = decorated_list();
        list.msg_footer = None;
        let mut msg = Message::parse(b"From: a@example.com\n\nbody\n").expect("parse");

        Decorate
            .handle(&fx.ctx(), &mut list, &mut msg, &mut Metadata::new())
            .expect("handle");
        let text = msg.first_text_plain().expect("text");
        assert!(text.starts_with("Test mailing list\nbody"));
    }

    #[test]
    fn no_templates_no_change() {
        let (_td, fx) = chain_fixture();
        let mut list = MailingList::new("test@example.com", "Test").expect("list");
        let mut msg = Message::parse(b"From: a@example.com\n\nbody\n").expect("parse");
        Decorate
            .handle(&fx.ctx(), &mut list, &mut msg, &mut Metadata::new())
            .expect("handle");
        assert_eq!(msg.first_text_plain(), Some("body\n"));
    }
}
