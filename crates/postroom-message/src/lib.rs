//! Owned RFC 5322 message model for the mail-processing pipeline.
//!
//! Handlers rewrite headers and bodies in place, so the model is fully
//! owned and mutable: an ordered header list plus a [`Body`]. Raw bytes
//! from the spool are parsed through `mail_parser` and materialised into
//! this model; serialisation produces deliverable RFC 5322 bytes with
//! generated MIME boundaries.
//!
//! # Example
//!
//! ```
//! use postroom_message::Message;
//!
//! let raw = b"From: anne@example.com\nSubject: hi\n\nhello\n";
//! let mut msg = Message::parse(raw).expect("parse");
//! assert_eq!(msg.get("subject"), Some("hi"));
//! msg.set("Subject", "[Test] hi");
//! let bytes = msg.to_bytes();
//! assert!(bytes.starts_with(b"From: anne@example.com\n"));
//! ```

mod mbox;
mod text;

pub use mbox::{MboxMessages, append_message, messages};
pub use text::{parse_address, split_address, wrap};

use anyhow::{Result, bail};
use chrono::Utc;

/// One header field: name as written, unfolded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Decoded text content (any text/* part, or an unstructured message).
    Text(String),
    /// A multipart container.
    Multipart(Multipart),
    /// A nested message/rfc822.
    Rfc822(Box<Message>),
    /// Undecoded bytes of a non-text part, emitted verbatim.
    Raw(Vec<u8>),
}

/// A multipart body: subtype plus ordered child parts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Multipart {
    pub subtype: String,
    pub preamble: Option<String>,
    pub parts: Vec<Message>,
    pub postamble: Option<String>,
}

/// An owned, mutable mail message (or MIME part).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    headers: Vec<Header>,
    body: Body,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// An empty text message with no headers.
    pub fn new() -> Self {
        Self {
            headers: Vec::new(),
            body: Body::Text(String::new()),
        }
    }

    /// A text/plain part with the given charset.
    pub fn text_plain(body: impl Into<String>, charset: &str) -> Self {
        let mut msg = Self {
            headers: Vec::new(),
            body: Body::Text(body.into()),
        };
        msg.append("Content-Type", format!("text/plain; charset=\"{charset}\""));
        msg.append("MIME-Version", "1.0");
        msg
    }

    /// An empty multipart container of the given subtype.
    pub fn multipart(subtype: &str) -> Self {
        let mut msg = Self {
            headers: Vec::new(),
            body: Body::Multipart(Multipart {
                subtype: subtype.to_string(),
                ..Multipart::default()
            }),
        };
        msg.append("MIME-Version", "1.0");
        msg
    }

    /// Parse raw RFC 5322 bytes into an owned message.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let parsed = mail_parser::MessageParser::default()
            .parse(raw)
            .ok_or_else(|| anyhow::anyhow!("unparseable message ({} bytes)", raw.len()))?;
        Ok(convert_message(&parsed))
    }

    // --- header access ---------------------------------------------------

    /// All headers in order.
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First value of the named header (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Every value of the named header, in order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    /// Whether the named header is present.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a header at the end.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replace the named header with a single value (removing duplicates),
    /// keeping the position of the first occurrence, or appending.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut kept = false;
        self.headers.retain_mut(|h| {
            if h.name.eq_ignore_ascii_case(name) {
                if kept {
                    return false;
                }
                kept = true;
                h.value = value.clone();
            }
            true
        });
        if !kept {
            self.append(name, value);
        }
    }

    /// Set the header only when absent.
    pub fn ensure(&mut self, name: &str, value: impl Into<String>) {
        if !self.has(name) {
            self.append(name, value);
        }
    }

    /// Remove every occurrence of the named header.
    pub fn remove(&mut self, name: &str) {
        self.headers
            .retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    // --- body access ------------------------------------------------------

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    /// Attach a part; the body must already be multipart.
    pub fn attach(&mut self, part: Message) -> Result<()> {
        match &mut self.body {
            Body::Multipart(mp) => {
                mp.parts.push(part);
                Ok(())
            }
            _ => bail!("cannot attach a part to a non-multipart message"),
        }
    }

    /// Set the text rendered after the final MIME boundary.
    pub fn set_postamble(&mut self, postamble: impl Into<String>) -> Result<()> {
        match &mut self.body {
            Body::Multipart(mp) => {
                mp.postamble = Some(postamble.into());
                Ok(())
            }
            _ => bail!("postamble only applies to multipart messages"),
        }
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self.body, Body::Multipart(_))
    }

    // --- conveniences -----------------------------------------------------

    /// The Subject header, if any.
    pub fn subject(&self) -> Option<&str> {
        self.get("subject")
    }

    /// Bare, lowercased address from the From header.
    pub fn sender(&self) -> Option<String> {
        self.get("from")
            .and_then(parse_address)
            .map(|(_, addr)| addr.to_ascii_lowercase())
    }

    /// `(type, subtype)` from the Content-Type header, lowercased.
    /// A missing header means an implicit `text/plain`.
    pub fn content_type(&self) -> (String, String) {
        match self.get("content-type") {
            Some(value) => {
                let main = value.split(';').next().unwrap_or("").trim();
                let mut pieces = main.splitn(2, '/');
                let ctype = pieces.next().unwrap_or("text").trim().to_ascii_lowercase();
                let subtype = pieces
                    .next()
                    .unwrap_or("plain")
                    .trim()
                    .to_ascii_lowercase();
                (ctype, subtype)
            }
            None => ("text".to_string(), "plain".to_string()),
        }
    }

    /// The first text/plain body in reading order, if any.
    ///
    /// A bare text message with no Content-Type counts; a non-plain
    /// top-level type (e.g. text/html) does not.
    pub fn first_text_plain(&self) -> Option<&str> {
        let (ctype, subtype) = self.content_type();
        match &self.body {
            Body::Text(text) => {
                if ctype == "text" && subtype == "plain" {
                    Some(text)
                } else {
                    None
                }
            }
            Body::Multipart(mp) => mp.parts.iter().find_map(|p| p.first_text_plain()),
            _ => None,
        }
    }

    /// Serialise to deliverable RFC 5322 bytes (LF line endings, as the
    /// spool convention demands).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match &self.body {
            Body::Multipart(mp) => {
                let boundary = make_boundary();
                for h in &self.headers {
                    if h.name.eq_ignore_ascii_case("content-type") {
                        continue;
                    }
                    write_header(out, &h.name, &h.value);
                }
                write_header(
                    out,
                    "Content-Type",
                    &format!("multipart/{}; boundary=\"{}\"", mp.subtype, boundary),
                );
                out.push(b'\n');
                if let Some(preamble) = &mp.preamble {
                    out.extend_from_slice(preamble.as_bytes());
                    out.push(b'\n');
                }
                for part in &mp.parts {
                    out.extend_from_slice(format!("--{boundary}\n").as_bytes());
                    part.write_to(out);
                    if !out.ends_with(b"\n") {
                        out.push(b'\n');
                    }
                }
                out.extend_from_slice(format!("--{boundary}--\n").as_bytes());
                if let Some(postamble) = &mp.postamble {
                    out.extend_from_slice(postamble.as_bytes());
                    out.push(b'\n');
                }
            }
            Body::Text(text) => {
                for h in &self.headers {
                    write_header(out, &h.name, &h.value);
                }
                out.push(b'\n');
                out.extend_from_slice(text.as_bytes());
                if !text.is_empty() && !text.ends_with('\n') {
                    out.push(b'\n');
                }
            }
            Body::Rfc822(inner) => {
                for h in &self.headers {
                    write_header(out, &h.name, &h.value);
                }
                out.push(b'\n');
                inner.write_to(out);
            }
            Body::Raw(bytes) => {
                for h in &self.headers {
                    write_header(out, &h.name, &h.value);
                }
                out.push(b'\n');
                out.extend_from_slice(bytes);
                if !bytes.is_empty() && !bytes.ends_with(b"\n") {
                    out.push(b'\n');
                }
            }
        }
    }
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    // Header values are stored unfolded; a stray newline would truncate
    // the header block, so space it out.
    for byte in value.bytes() {
        match byte {
            b'\r' | b'\n' => out.push(b' '),
            other => out.push(other),
        }
    }
    out.push(b'\n');
}

/// Generate a unique MIME boundary.
fn make_boundary() -> String {
    format!("==============={:020}==", rand::random::<u64>())
}

/// Generate a Message-ID for the given host.
pub fn make_message_id(hostname: &str) -> String {
    format!(
        "<{}.{:x}.{:x}@{}>",
        Utc::now().timestamp(),
        std::process::id(),
        rand::random::<u64>(),
        hostname
    )
}

/// Current time as an RFC 2822 Date header value.
pub fn rfc2822_now() -> String {
    Utc::now().to_rfc2822()
}

// --- mail_parser conversion ----------------------------------------------

fn convert_message(parsed: &mail_parser::Message<'_>) -> Message {
    convert_part(parsed, 0)
}

fn convert_part(parsed: &mail_parser::Message<'_>, id: usize) -> Message {
    use mail_parser::PartType;

    let part = &parsed.parts[id];
    let raw = parsed.raw_message.as_ref();

    let mut headers: Vec<Header> = part
        .headers
        .iter()
        .map(|h| Header {
            name: h.name.as_str().to_string(),
            value: unfold_raw_value(&raw[h.offset_start..h.offset_end]),
        })
        .collect();

    let body = match &part.body {
        PartType::Text(text) | PartType::Html(text) => {
            // Text arrives decoded; the original transfer encoding no
            // longer describes the bytes we will re-emit.
            headers.retain(|h| !h.name.eq_ignore_ascii_case("content-transfer-encoding"));
            Body::Text(text.to_string())
        }
        PartType::Binary(_) | PartType::InlineBinary(_) => {
            // Keep the undecoded on-the-wire bytes so the stored
            // Content-Transfer-Encoding stays truthful.
            let start = part.offset_body.min(raw.len());
            let end = part.offset_end.min(raw.len());
            Body::Raw(raw[start..end].to_vec())
        }
        PartType::Message(inner) => Body::Rfc822(Box::new(convert_message(inner))),
        PartType::Multipart(child_ids) => {
            let subtype = part
                .headers
                .iter()
                .find_map(|h| match &h.value {
                    mail_parser::HeaderValue::ContentType(ct) => {
                        ct.c_subtype.as_ref().map(|s| s.to_string())
                    }
                    _ => None,
                })
                .unwrap_or_else(|| "mixed".to_string());
            Body::Multipart(Multipart {
                subtype,
                preamble: None,
                parts: child_ids
                    .iter()
                    .map(|child| convert_part(parsed, *child))
                    .collect(),
                postamble: None,
            })
        }
    };

    Message { headers, body }
}

/// Unfold a raw header value slice: join continuation lines with a single
/// space and trim surrounding whitespace.
fn unfold_raw_value(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut unfolded = String::with_capacity(text.len());
    for line in text.split('\n') {
        let piece = line.trim_end_matches('\r').trim_start();
        if piece.is_empty() {
            continue;
        }
        if !unfolded.is_empty() {
            unfolded.push(' ');
        }
        unfolded.push_str(piece);
    }
    unfolded.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple() -> Message {
        Message::parse(
            b"From: Anne Person <anne@example.com>\n\
              To: test@example.com\n\
              Subject: A test message\n\
              Message-ID: <first>\n\
              \n\
              Nothing.\n",
        )
        .expect("parse")
    }

    #[test]
    fn parse_preserves_header_order_and_values() {
        let msg = simple();
        let names: Vec<&str> = msg.headers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["From", "To", "Subject", "Message-ID"]);
        assert_eq!(msg.get("subject"), Some("A test message"));
        assert_eq!(msg.get("MESSAGE-ID"), Some("<first>"));
    }

    #[test]
    fn parse_unfolds_continuation_lines() {
        let msg = Message::parse(
            b"Subject: a folded\n  subject line\nFrom: a@example.com\n\nbody\n",
        )
        .expect("parse");
        assert_eq!(msg.get("subject"), Some("a folded subject line"));
    }

    #[test]
    fn sender_extracts_lowercased_address() {
        let msg = simple();
        assert_eq!(msg.sender().as_deref(), Some("anne@example.com"));
    }

    #[test]
    fn set_replaces_in_place_and_removes_duplicates() {
        let mut msg = simple();
        msg.append("X-Tag", "one");
        msg.append("X-Tag", "two");
        msg.set("X-Tag", "final");
        assert_eq!(msg.get_all("x-tag"), vec!["final"]);

        msg.set("Subject", "rewritten");
        // Position of the first occurrence is kept.
        assert_eq!(msg.headers()[2].name, "Subject");
        assert_eq!(msg.headers()[2].value, "rewritten");
    }

    #[test]
    fn ensure_only_sets_when_missing() {
        let mut msg = simple();
        msg.ensure("Message-ID", "<other>");
        assert_eq!(msg.get("message-id"), Some("<first>"));
        msg.ensure("Date", "Tue, 14 Jun 2011 21:12:00 -0400");
        assert!(msg.has("date"));
    }

    #[test]
    fn remove_strips_all_occurrences() {
        let mut msg = simple();
        msg.append("Received", "one");
        msg.append("Received", "two");
        msg.remove("received");
        assert!(!msg.has("received"));
    }

    #[test]
    fn content_type_defaults_to_text_plain() {
        let msg = simple();
        assert_eq!(
            msg.content_type(),
            ("text".to_string(), "plain".to_string())
        );
    }

    #[test]
    fn first_text_plain_on_bare_message() {
        let msg = simple();
        assert_eq!(msg.first_text_plain(), Some("Nothing.\n"));
    }

    #[test]
    fn first_text_plain_skips_html_top_level() {
        let msg = Message::parse(
            b"From: a@example.com\nContent-Type: text/html\n\n<p>hi</p>\n",
        )
        .expect("parse");
        assert_eq!(msg.first_text_plain(), None);
    }

    #[test]
    fn first_text_plain_finds_nested_part() {
        let mut outer = Message::multipart("mixed");
        outer
            .attach(Message::text_plain("the plain part\n", "utf-8"))
            .expect("attach");
        assert_eq!(outer.first_text_plain(), Some("the plain part\n"));
    }

    #[test]
    fn serialize_round_trips_through_parse() {
        let mut msg = simple();
        msg.set("Subject", "[Test] A test message");
        let bytes = msg.to_bytes();
        let back = Message::parse(&bytes).expect("reparse");
        assert_eq!(back.get("subject"), Some("[Test] A test message"));
        assert_eq!(back.first_text_plain().map(str::trim_end), Some("Nothing."));
    }

    #[test]
    fn serialize_multipart_emits_boundaries() {
        let mut msg = Message::multipart("mixed");
        msg.append("From", "list-request@example.com");
        msg.attach(Message::text_plain("part one\n", "utf-8"))
            .expect("attach");
        msg.attach(Message::text_plain("part two\n", "utf-8"))
            .expect("attach");
        msg.set_postamble("End of Test Digest").expect("postamble");

        let bytes = msg.to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("Content-Type: multipart/mixed; boundary="));
        assert!(text.trim_end().ends_with("End of Test Digest"));

        let back = Message::parse(&bytes).expect("reparse");
        match back.body() {
            Body::Multipart(mp) => {
                assert_eq!(mp.subtype, "mixed");
                assert_eq!(mp.parts.len(), 2);
                // The newline before a boundary belongs to the delimiter,
                // so compare modulo trailing whitespace.
                assert_eq!(
                    mp.parts[0].first_text_plain().map(str::trim_end),
                    Some("part one")
                );
            }
            other => panic!("expected multipart, got {other:?}"),
        }
    }

    #[test]
    fn serialize_rfc822_attachment() {
        let original = simple();
        let mut wrapper = Message::multipart("mixed");
        wrapper.append("Subject", "The results of your email commands");
        let mut attachment = Message::new();
        attachment.append("Content-Type", "message/rfc822");
        attachment.set_body(Body::Rfc822(Box::new(original)));
        wrapper.attach(attachment).expect("attach");

        let back = Message::parse(&wrapper.to_bytes()).expect("reparse");
        match back.body() {
            Body::Multipart(mp) => match mp.parts[0].body() {
                Body::Rfc822(inner) => {
                    assert_eq!(inner.get("message-id"), Some("<first>"));
                }
                other => panic!("expected nested message, got {other:?}"),
            },
            other => panic!("expected multipart, got {other:?}"),
        }
    }

    #[test]
    fn header_values_with_newlines_cannot_split_the_block() {
        let mut msg = Message::new();
        msg.append("X-Evil", "a\nInjected: yes");
        let bytes = msg.to_bytes();
        let back = Message::parse(&bytes).expect("reparse");
        assert!(!back.has("injected"));
    }

    #[test]
    fn make_message_id_is_unique_and_addressed() {
        let a = make_message_id("example.com");
        let b = make_message_id("example.com");
        assert_ne!(a, b);
        assert!(a.starts_with('<') && a.ends_with("@example.com>"));
    }
}
