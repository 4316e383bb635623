//! Structural scanning of regex sources and `$N` substitution templates.
//!
//! Capturing groups are located by walking the pattern with awareness of
//! escapes, character classes and `(?...)` groups, so `\(`, `[(]` and
//! `(?:..)` never produce spurious group indices.

/// One capturing group of a regex source, numbered the way the regex
/// engine numbers them (1-based, by position of the opening paren).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureGroup {
    pub index: usize,
    /// Byte offset of the opening `(`.
    pub open: usize,
    /// Byte offset of the first byte of the group body.
    pub body_start: usize,
    /// Byte offset of the closing `)`.
    pub close: usize,
    /// Number of enclosing groups of any kind.
    pub depth: usize,
}

impl CaptureGroup {
    pub fn body<'a>(&self, pattern: &'a str) -> &'a str {
        &pattern[self.body_start..self.close]
    }
}

/// A piece of a substitution template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateToken {
    /// Template text exactly as written (`\$` escapes intact).
    Literal(String),
    /// A `$N` reference to working-directory group N.
    Group(usize),
}

/// A piece of a working-directory regex, as used to rebuild a name from
/// captured group values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkeletonPiece {
    Literal(String),
    Group(usize),
}

#[derive(Debug)]
struct OpenGroup {
    open: usize,
    body_start: usize,
    capture: Option<usize>,
}

/// Enumerate the capturing groups of `pattern` in engine order.
///
/// Named groups (`(?P<n>..)`, `(?<n>..)`) count as capturing; all other
/// `(?...)` forms do not. Unbalanced parentheses are reported as an error.
pub fn capture_groups(pattern: &str) -> Result<Vec<CaptureGroup>, String> {
    let bytes = pattern.as_bytes();
    let mut stack: Vec<OpenGroup> = Vec::new();
    let mut groups: Vec<CaptureGroup> = Vec::new();
    let mut next_index = 1;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'[' => i = skip_class(bytes, i)?,
            b'(' => {
                let (capture, body_start) = if bytes.get(i + 1) == Some(&b'?') {
                    match named_group_body_start(bytes, i) {
                        Some(start) => (true, start),
                        None => (false, i + 1),
                    }
                } else {
                    (true, i + 1)
                };
                let capture = if capture {
                    let index = next_index;
                    next_index += 1;
                    Some(index)
                } else {
                    None
                };
                stack.push(OpenGroup {
                    open: i,
                    body_start,
                    capture,
                });
                i = body_start.max(i + 1);
            }
            b')' => {
                let open = stack
                    .pop()
                    .ok_or_else(|| format!("unmatched ')' at offset {}", i))?;
                if let Some(index) = open.capture {
                    groups.push(CaptureGroup {
                        index,
                        open: open.open,
                        body_start: open.body_start,
                        close: i,
                        depth: stack.len(),
                    });
                }
                i += 1;
            }
            _ => i += 1,
        }
    }

    if let Some(open) = stack.pop() {
        return Err(format!("unclosed '(' at offset {}", open.open));
    }
    groups.sort_by_key(|g| g.index);
    Ok(groups)
}

/// For `(?P<name>` or `(?<name>` starting at `open`, return the offset just
/// past `>`. Lookbehind forms `(?<=` / `(?<!` are not named groups.
fn named_group_body_start(bytes: &[u8], open: usize) -> Option<usize> {
    let name_start = match (bytes.get(open + 2), bytes.get(open + 3)) {
        (Some(b'P'), Some(b'<')) => open + 4,
        (Some(b'<'), Some(next)) if *next != b'=' && *next != b'!' => open + 3,
        _ => return None,
    };
    let close = bytes[name_start..].iter().position(|b| *b == b'>')?;
    Some(name_start + close + 1)
}

/// Skip a bracketed character class starting at `start`, returning the
/// offset just past its closing `]`. Nested classes are allowed.
fn skip_class(bytes: &[u8], start: usize) -> Result<usize, String> {
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'[' => {
                depth += 1;
                i += 1;
                // A leading `]` (after an optional `^`) is a literal member.
                if bytes.get(i) == Some(&b'^') {
                    i += 1;
                }
                if bytes.get(i) == Some(&b']') {
                    i += 1;
                }
                continue;
            }
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(format!("unclosed '[' at offset {}", start))
}

/// Count the capturing groups in `pattern`.
pub fn count_groups(pattern: &str) -> Result<usize, String> {
    capture_groups(pattern).map(|groups| groups.len())
}

/// Rewrite named groups in `body` as plain capturing groups.
///
/// Group bodies are duplicated when a template repeats a substitution, and
/// the regex engine rejects duplicate group names.
pub fn strip_group_names(body: &str) -> String {
    let groups = match capture_groups(body) {
        Ok(groups) => groups,
        Err(_) => return body.to_string(),
    };
    let mut out = String::with_capacity(body.len());
    let mut cursor = 0;
    let mut opens: Vec<&CaptureGroup> = groups
        .iter()
        .filter(|g| g.body_start != g.open + 1)
        .collect();
    opens.sort_by_key(|g| g.open);
    for group in opens {
        out.push_str(&body[cursor..group.open]);
        out.push('(');
        cursor = group.body_start;
    }
    out.push_str(&body[cursor..]);
    out
}

/// Split a substitution template into literal text and `$N` references.
///
/// A `$` preceded by a backslash is literal text.
pub fn template_tokens(template: &str) -> Vec<TemplateToken> {
    let bytes = template.as_bytes();
    let mut tokens = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'$' => {
                let digits_end = bytes[i + 1..]
                    .iter()
                    .position(|b| !b.is_ascii_digit())
                    .map_or(bytes.len(), |p| i + 1 + p);
                match template[i + 1..digits_end].parse::<usize>() {
                    Ok(index) => {
                        if literal_start < i {
                            tokens.push(TemplateToken::Literal(
                                template[literal_start..i].to_string(),
                            ));
                        }
                        tokens.push(TemplateToken::Group(index));
                        literal_start = digits_end;
                        i = digits_end;
                    }
                    Err(_) => i += 1,
                }
            }
            _ => i += 1,
        }
    }

    if literal_start < template.len() {
        tokens.push(TemplateToken::Literal(
            template[literal_start.min(template.len())..].to_string(),
        ));
    }
    tokens
}

/// Render template literal text as it appears in a file name: escaped
/// characters lose their backslash.
pub fn template_literal_text(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    let mut chars = literal.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Break a working-directory regex into literal text and its outermost
/// capturing groups.
pub fn skeleton(pattern: &str, groups: &[CaptureGroup]) -> Vec<SkeletonPiece> {
    let mut outer: Vec<&CaptureGroup> = groups.iter().filter(|g| g.depth == 0).collect();
    outer.sort_by_key(|g| g.open);

    let mut pieces = Vec::new();
    let mut cursor = 0;
    for group in outer {
        if cursor < group.open {
            pieces.push(SkeletonPiece::Literal(unescape_literal(
                &pattern[cursor..group.open],
            )));
        }
        pieces.push(SkeletonPiece::Group(group.index));
        cursor = group.close + 1;
    }
    if cursor < pattern.len() {
        pieces.push(SkeletonPiece::Literal(unescape_literal(&pattern[cursor..])));
    }

    if let Some(SkeletonPiece::Literal(first)) = pieces.first_mut() {
        if let Some(stripped) = first.strip_prefix('^') {
            *first = stripped.to_string();
        }
    }
    pieces
}

/// Turn regex literal text back into the text it matches: escaped
/// characters lose their backslash and unescaped anchors are dropped.
fn unescape_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '$' if chars.peek().is_none() => {}
            _ => out.push(ch),
        }
    }
    out
}

/// Split a regex source on `/` outside groups and character classes.
pub fn split_path_segments(pattern: &str) -> Vec<String> {
    let bytes = pattern.as_bytes();
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'[' => {
                i = skip_class(bytes, i).unwrap_or(bytes.len());
                continue;
            }
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b'/' if depth == 0 => {
                segments.push(pattern[start..i].to_string());
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    segments.push(pattern[start.min(pattern.len())..].to_string());
    segments
}
