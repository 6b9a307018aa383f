//! Text utilities: paragraph filling/wrapping and lightweight address
//! parsing for the handful of header shapes mailing-list traffic uses.

/// Wrap and fill `text` to the specified column.
///
/// Paragraphs (separated by blank lines) are filled, except that lines
/// beginning with whitespace keep their own line. A word longer than the
/// column is broken at the next whitespace boundary rather than split.
pub fn wrap(text: &str, column: usize) -> String {
    let mut paragraphs = Vec::new();

    for para in text.split("\n\n") {
        // Fill: join consecutive fillable lines into logical lines.
        let mut logical: Vec<String> = Vec::new();
        let mut prev_fillable = false;
        for line in para.split('\n') {
            if line.is_empty() {
                logical.push(String::new());
                prev_fillable = false;
                continue;
            }
            let fillable = !line.starts_with([' ', '\t']);
            if fillable && prev_fillable {
                if let Some(last) = logical.last_mut() {
                    let trimmed = last.trim_end().to_string();
                    *last = format!("{} {}", trimmed, line);
                }
            } else {
                logical.push(line.to_string());
            }
            prev_fillable = fillable;
        }

        // Wrap each logical line at the column.
        let mut wrapped_lines: Vec<String> = Vec::new();
        for line in logical {
            wrapped_lines.extend(wrap_line(&line, column));
        }
        paragraphs.push(wrapped_lines.join("\n"));
    }

    paragraphs.join("\n\n")
}

fn wrap_line(line: &str, column: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = line.to_string();
    loop {
        if rest.chars().count() <= column {
            out.push(rest);
            return out;
        }
        let chars: Vec<char> = rest.chars().collect();
        // Last whitespace at or before the column.
        let mut cut = None;
        for i in (1..=column.min(chars.len() - 1)).rev() {
            if chars[i].is_whitespace() {
                cut = Some(i);
                break;
            }
        }
        // No break point before the column: break at the next whitespace.
        if cut.is_none() {
            cut = chars
                .iter()
                .enumerate()
                .skip(column)
                .find(|(_, c)| c.is_whitespace())
                .map(|(i, _)| i);
        }
        match cut {
            Some(i) => {
                let head: String = chars[..i].iter().collect();
                out.push(head.trim_end().to_string());
                rest = chars[i..]
                    .iter()
                    .collect::<String>()
                    .trim_start()
                    .to_string();
            }
            None => {
                out.push(rest);
                return out;
            }
        }
    }
}

/// Parse the common address shapes found in From/To headers:
///
/// - `User J. Person <person@example.com>`
/// - `person@example.com (User J. Person)`
/// - `<person@example.com>` / bare `person@example.com`
///
/// Returns `(display_name, address)`; addresses are stripped of angle
/// brackets and surrounding whitespace, never case-folded.
pub fn parse_address(value: &str) -> Option<(Option<String>, String)> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    // Name <addr> form.
    if let Some(open) = value.rfind('<') {
        let close = value[open..].find('>').map(|i| open + i)?;
        let addr = value[open + 1..close].trim();
        if addr.is_empty() {
            return None;
        }
        let name = value[..open].trim().trim_matches('"').trim();
        let name = if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        };
        return Some((name, addr.to_string()));
    }

    // addr (Name) form.
    if let Some(open) = value.find('(') {
        let close = value.rfind(')').unwrap_or(value.len());
        let addr = value[..open].trim();
        if addr.is_empty() {
            return None;
        }
        let name = value[open + 1..close].trim();
        let name = if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        };
        return Some((name, addr.to_string()));
    }

    // Bare address.
    if value.contains(char::is_whitespace) {
        return None;
    }
    Some((None, value.to_string()))
}

/// Split an address into `(local_part, domain)`, both lowercased.
pub fn split_address(addr: &str) -> Option<(String, String)> {
    let at = addr.find('@')?;
    let local = addr[..at].trim().to_ascii_lowercase();
    let domain = addr[at + 1..].trim().to_ascii_lowercase();
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some((local, domain))
}
