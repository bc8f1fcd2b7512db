//! String-aware scanning and light repair helpers
//!
//! All scanners track whether they are inside a double-quoted string so that
//! braces, brackets, and commas inside string values are never treated as
//! structure.

const FENCE: &str = "```";

/// Returns the body of the first markdown fenced code block
///
/// An optional language tag on the opening fence line is skipped. Returns
/// `None` if there is no closing fence.
pub fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find(FENCE)?;
    let after = &text[open + FENCE.len()..];

    let body_start = match after.find('\n') {
        Some(nl) if is_info_string(&after[..nl]) => nl + 1,
        _ => 0,
    };

    let body = &after[body_start..];
    let close = body.find(FENCE)?;
    Some(&body[..close])
}

fn is_info_string(line: &str) -> bool {
    line.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'))
}

/// Returns the first balanced `{...}` or `[...]` span
///
/// Returns `None` when the first opener is never closed or is closed by the
/// wrong delimiter.
pub fn find_balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut expected = Vec::new();
    let mut scanner = StringScanner::default();

    for (i, b) in text.bytes().enumerate().skip(start) {
        if scanner.consume(b) {
            continue;
        }
        match b {
            b'{' => expected.push(b'}'),
            b'[' => expected.push(b']'),
            b'}' | b']' => {
                if expected.pop() != Some(b) {
                    return None;
                }
                if expected.is_empty() {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Drops commas that directly precede a closing `}` or `]`
pub fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut scanner = StringScanner::default();

    for (i, &c) in chars.iter().enumerate() {
        if !scanner.consume_char(c) && c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }

    out
}

/// Wraps unquoted object keys in double quotes
///
/// Only identifiers that follow `{` or `,` and are followed by `:` count as
/// keys, so bare `true`/`false`/`null` values are left alone.
pub fn quote_bare_keys(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut scanner = StringScanner::default();
    let mut last_significant: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if scanner.consume_char(c) {
            out.push(c);
            last_significant = Some('"');
            i += 1;
            continue;
        }

        if is_ident_start(c) && matches!(last_significant, Some('{') | Some(',')) {
            let end = chars[i..]
                .iter()
                .position(|&ch| !is_ident_continue(ch))
                .map_or(chars.len(), |p| i + p);
            let colon = chars[end..]
                .iter()
                .find(|ch| !ch.is_whitespace())
                .is_some_and(|&ch| ch == ':');

            if colon {
                out.push('"');
                out.extend(&chars[i..end]);
                out.push('"');
                last_significant = Some('"');
                i = end;
                continue;
            }
        }

        out.push(c);
        if !c.is_whitespace() {
            last_significant = Some(c);
        }
        i += 1;
    }

    out
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '-')
}

/// Tracks double-quoted string state across a scan
#[derive(Default)]
struct StringScanner {
    in_string: bool,
    escaped: bool,
}

impl StringScanner {
    /// Feeds one byte; returns true if it belongs to a string literal
    fn consume(&mut self, b: u8) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            } else if b == b'"' {
                self.in_string = false;
            }
            return true;
        }

        if b == b'"' {
            self.in_string = true;
            return true;
        }

        false
    }

    fn consume_char(&mut self, c: char) -> bool {
        if c.is_ascii() {
            self.consume(c as u8)
        } else {
            self.in_string
        }
    }
}
