//! Traditional `From `-separated (mbox-O) mailbox handling.
//!
//! Digest accumulation appends whole messages framed by an envelope
//! `From ` line; body lines that would themselves begin `From ` are
//! quoted with `>`. Parsing is a pure function over the mailbox bytes
//! yielding a restartable iterator of unescaped message byte vectors.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

/// Append one message to an mbox file, creating it if needed.
///
/// On Unix the file is created mode 0o660 so the accumulating digest is
/// not world-readable.
pub fn append_message(path: &Path, envelope_from: &str, message: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o660);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to open mbox {}", path.display()))?;

    let mut framed = Vec::with_capacity(message.len() + 128);
    framed.extend_from_slice(
        format!(
            "From {} {}\n",
            envelope_from,
            Utc::now().format("%a %b %e %H:%M:%S %Y")
        )
        .as_bytes(),
    );
    for line in split_inclusive_lines(message) {
        if line.starts_with(b"From ") {
            framed.push(b'>');
        }
        framed.extend_from_slice(line);
    }
    if !framed.ends_with(b"\n") {
        framed.push(b'\n');
    }
    framed.push(b'\n');

    file.write_all(&framed)
        .with_context(|| format!("failed to append to mbox {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush mbox {}", path.display()))?;
    Ok(())
}

/// Iterate the messages stored in mailbox bytes, in order.
///
/// Each yielded item is the unescaped raw message (envelope line removed,
/// `>From ` quoting reversed, trailing separator blank line dropped).
pub fn messages(mbox: &[u8]) -> MboxMessages<'_> {
    MboxMessages { rest: mbox }
}

/// Iterator over the messages of an mbox byte buffer.
#[derive(Debug, Clone)]
pub struct MboxMessages<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for MboxMessages<'a> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        // Skip forward to the next envelope line.
        loop {
            if self.rest.is_empty() {
                return None;
            }
            if self.rest.starts_with(b"From ") {
                break;
            }
            match find_line_start_of(b"\nFrom ", self.rest) {
                Some(pos) => self.rest = &self.rest[pos + 1..],
                None => {
                    self.rest = b"";
                    return None;
                }
            }
        }

        // Drop the envelope line itself.
        let body_start = match self.rest.iter().position(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => self.rest.len(),
        };
        let after_envelope = &self.rest[body_start..];

        let (chunk, rest) = match find_line_start_of(b"\nFrom ", after_envelope) {
            Some(pos) => (&after_envelope[..pos + 1], &after_envelope[pos + 1..]),
            None => (after_envelope, &b""[..]),
        };
        self.rest = rest;

        let mut message = Vec::with_capacity(chunk.len());
        for line in split_inclusive_lines(chunk) {
            if line.starts_with(b">From ") {
                message.extend_from_slice(&line[1..]);
            } else {
                message.extend_from_slice(line);
            }
        }
        // The blank separator line before the next envelope is framing,
        // not message content.
        while message.ends_with(b"\n\n") {
            message.pop();
        }
        Some(message)
    }
}

/// Byte offset of the first occurrence of `needle` in `haystack`, where
/// the match begins at a line boundary marker (`needle` starts with the
/// newline of the preceding line).
fn find_line_start_of(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn split_inclusive_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes.split_inclusive(|&b| b == b'\n')
}
