// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! Splitting of Simple Query strings into individual statements.
//!
//! Statements are separated by `;`, except within quoted strings,
//! quoted identifiers, dollar-quoted strings, and comments.

/// Splits `query` on top-level `;` separators.
///
/// Statements are returned trimmed and without their separator. Pieces made
/// of blanks and comments only are dropped, unless nothing else is left: a
/// blank query makes a single empty statement, to be answered with
/// `EmptyQueryResponse`.
pub fn split_query(query: &str) -> Vec<String> {
    let bytes = query.as_bytes();
    let mut statements = Vec::new();

    let mut start = 0;
    let mut has_content = false;
    let mut pos = 0;

    while pos < bytes.len() {
        match bytes[pos] {
            b'\'' => {
                pos = skip_quoted(bytes, pos, b'\'', is_escape_string(bytes, pos));
                has_content = true;
                continue;
            }
            b'"' => {
                pos = skip_quoted(bytes, pos, b'"', false);
                has_content = true;
                continue;
            }
            b'-' if bytes.get(pos + 1) == Some(&b'-') => {
                pos = skip_line_comment(bytes, pos);
                continue;
            }
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                pos = skip_block_comment(bytes, pos);
                continue;
            }
            b'$' => {
                has_content = true;
                if let Some(end) = skip_dollar_quoted(bytes, pos) {
                    pos = end;
                    continue;
                }
            }
            b';' => {
                if has_content {
                    statements.push(query[start..pos].trim().to_string());
                }
                start = pos + 1;
                has_content = false;
            }
            byte if byte.is_ascii_whitespace() => {}
            _ => has_content = true,
        }
        pos += 1;
    }

    if has_content {
        statements.push(query[start..].trim().to_string());
    } else if statements.is_empty() {
        statements.push(String::new());
    }

    log::trace!("split query into {} statement(s)", statements.len());
    statements
}

fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte >= 0x80
}

/// Whether the quote at `pos` opens an `E'...'` string, with backslash escapes.
fn is_escape_string(bytes: &[u8], pos: usize) -> bool {
    match pos {
        0 => false,
        1 => matches!(bytes[0], b'E' | b'e'),
        _ => matches!(bytes[pos - 1], b'E' | b'e') && !is_identifier_byte(bytes[pos - 2]),
    }
}

/// Returns the position right after the string opened at `pos`.
///
/// A doubled quote stands for the quote itself.
fn skip_quoted(bytes: &[u8], pos: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut pos = pos + 1;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' if backslash_escapes => pos += 2,
            byte if byte == quote => {
                if bytes.get(pos + 1) == Some(&quote) {
                    pos += 2;
                } else {
                    return pos + 1;
                }
            }
            _ => pos += 1,
        }
    }
    bytes.len()
}

fn skip_line_comment(bytes: &[u8], pos: usize) -> usize {
    match bytes[pos..].iter().position(|b| *b == b'\n') {
        Some(offset) => pos + offset + 1,
        None => bytes.len(),
    }
}

/// Block comments nest, unlike in the SQL standard.
fn skip_block_comment(bytes: &[u8], pos: usize) -> usize {
    let mut depth = 0;
    let mut pos = pos;
    while pos < bytes.len() {
        if bytes[pos..].starts_with(b"/*") {
            depth += 1;
            pos += 2;
        } else if bytes[pos..].starts_with(b"*/") {
            depth -= 1;
            pos += 2;
            if depth == 0 {
                return pos;
            }
        } else {
            pos += 1;
        }
    }
    bytes.len()
}

/// Returns the position right after the `$tag$...$tag$` string at `pos`,
/// or `None` if `pos` does not open one (e.g. a `$1` parameter).
fn skip_dollar_quoted(bytes: &[u8], pos: usize) -> Option<usize> {
    if pos > 0 && is_identifier_byte(bytes[pos - 1]) {
        return None;
    }

    let tag_start = pos + 1;
    let mut tag_end = tag_start;
    while tag_end < bytes.len() && is_identifier_byte(bytes[tag_end]) {
        if tag_end == tag_start && bytes[tag_end].is_ascii_digit() {
            return None;
        }
        tag_end += 1;
    }
    if bytes.get(tag_end) != Some(&b'$') {
        return None;
    }

    let delimiter = &bytes[pos..=tag_end];
    let body = tag_end + 1;
    let end = bytes[body..]
        .windows(delimiter.len())
        .position(|window| window == delimiter)
        .map(|offset| body + offset + delimiter.len())
        .unwrap_or(bytes.len());

    Some(end)
}
